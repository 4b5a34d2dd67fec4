// Leaf modules: wire types and room configuration
pub mod config;
pub mod protocol;
pub mod types;

// Transport and presence
pub mod channel;
pub mod presence;

// Media capture and negotiation (webrtc engine behind the seam)
pub mod media;
pub mod negotiation;
pub mod rtc;

// Call lifecycle, history, observers
pub mod call;
pub mod events;
pub mod history;

// Embedder facade
pub mod client;

pub use call::machine::CallError;
pub use call::session::{CallOutcome, CallPhase, CallSession, TerminationReason};
pub use client::{CallClient, CallClientBuilder};
pub use config::{ClientConfig, RoomContext};
pub use types::{Availability, CallDirection, MediaKind, PeerId, PeerInfo};
