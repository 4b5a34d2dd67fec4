use crate::call::session::{CallOutcome, CallSession, TerminationReason};
use crate::types::{MediaKind, PeerId, PeerInfo};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// The relay accepted our connection (again, after a redial).
#[derive(Debug, Clone)]
pub struct Connected;

/// The connection dropped; a redial is already scheduled.
#[derive(Debug, Clone)]
pub struct Disconnected;

/// The relay refused the room for good; no redial follows.
#[derive(Debug, Clone)]
pub struct RoomClosed {
    pub reason: String,
}

/// The relay assigned us an id (private rooms).
#[derive(Debug, Clone)]
pub struct SelfIdentified {
    pub id: PeerId,
}

/// Fresh roster snapshot.
#[derive(Debug, Clone)]
pub struct RosterUpdate {
    pub peers: Vec<PeerInfo>,
}

/// A peer is calling; answer with `accept()` or `decline()`.
#[derive(Debug, Clone)]
pub struct IncomingRing {
    pub peer: PeerInfo,
    pub media: MediaKind,
}

/// The current session changed phase. Carries a full snapshot so
/// observers never need to query back.
#[derive(Debug, Clone)]
pub struct CallStateChanged {
    pub session: CallSession,
}

/// A session reached its terminal phase.
#[derive(Debug, Clone)]
pub struct CallConcluded {
    pub session: CallSession,
    pub reason: TerminationReason,
    pub outcome: CallOutcome,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event
        /// type. Observers subscribe to what they render; the machine
        /// never blocks on a slow or absent listener.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Channel events
    (connected, Arc<Connected>),
    (disconnected, Arc<Disconnected>),
    (room_closed, Arc<RoomClosed>),
    (self_identified, Arc<SelfIdentified>),

    // Presence events
    (roster, Arc<RosterUpdate>),

    // Call events
    (incoming_ring, Arc<IncomingRing>),
    (call_state, Arc<CallStateChanged>),
    (call_concluded, Arc<CallConcluded>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
