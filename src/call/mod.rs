pub mod machine;
pub mod session;

pub use machine::{CallError, CallMachine};
pub use session::{CallOutcome, CallPhase, CallSession, TerminationReason};
