//! Call session record and lifecycle phases.

use crate::types::{CallDirection, MediaKind, PeerInfo};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Current phase of a call session.
#[derive(Debug, Clone, Serialize)]
pub enum CallPhase {
    /// Outgoing call: invite sent, waiting for the callee to pick up.
    Outgoing { dialed_at: DateTime<Utc> },
    /// Incoming call: ringing locally, waiting for a local gesture.
    IncomingRinging { received_at: DateTime<Utc> },
    /// Both sides committed; offer/answer/ICE exchange in progress.
    Negotiating { accepted_at: DateTime<Utc> },
    /// Media path established.
    Active { connected_at: DateTime<Utc> },
    /// Terminal. No transition leaves this phase.
    Ended {
        outcome: CallOutcome,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::Negotiating { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Outgoing { .. } | Self::IncomingRinging { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::IncomingRinging { .. })
    }

    pub fn can_decline(&self) -> bool {
        matches!(self, Self::IncomingRinging { .. })
    }
}

/// Why a session left the in-flight phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Local user hung up or cancelled the attempt.
    LocalHangup,
    /// Local user declined an incoming ring.
    LocalDecline,
    /// The relay reported the peer ended (hangup or decline, the relay
    /// does not distinguish).
    PeerEnded,
    /// The relay's ring timeout fired before the callee picked up.
    RingTimeout,
    /// Local capture failed or was refused.
    MediaDenied,
    /// Offer/answer/ICE application failed.
    NegotiationFailed,
    /// The signaling channel dropped mid-call.
    ConnectionLost,
    /// The relay expired the room.
    RoomExpired,
    /// This attempt yielded to a simultaneous call from the same peer.
    Superseded,
}

/// How a concluded session is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Answered,
    Missed,
    Declined,
    NoAnswer,
    Cancelled,
}

/// State transitions for sessions.
#[derive(Debug, Clone)]
pub enum CallTransition {
    RemoteAccepted,
    LocalAccepted,
    MediaConnected,
    Terminated { reason: TerminationReason },
}

/// One call attempt, outgoing or incoming. At most one non-terminal
/// session exists at a time; resources (media, negotiation) live beside
/// it in the machine, so the record itself stays cheap to clone into
/// observer events.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub peer: PeerInfo,
    pub direction: CallDirection,
    pub media: MediaKind,
    pub phase: CallPhase,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new_outgoing(peer: PeerInfo, media: MediaKind) -> Self {
        let now = Utc::now();
        Self {
            peer,
            direction: CallDirection::Outgoing,
            media,
            phase: CallPhase::Outgoing { dialed_at: now },
            started_at: now,
        }
    }

    pub fn new_incoming(peer: PeerInfo, media: MediaKind) -> Self {
        let now = Utc::now();
        Self {
            peer,
            direction: CallDirection::Incoming,
            media,
            phase: CallPhase::IncomingRinging { received_at: now },
            started_at: now,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_phase = match (&self.phase, transition) {
            (CallPhase::Outgoing { .. }, CallTransition::RemoteAccepted) => {
                CallPhase::Negotiating {
                    accepted_at: Utc::now(),
                }
            }
            (CallPhase::IncomingRinging { .. }, CallTransition::LocalAccepted) => {
                CallPhase::Negotiating {
                    accepted_at: Utc::now(),
                }
            }
            (CallPhase::Negotiating { .. }, CallTransition::MediaConnected) => CallPhase::Active {
                connected_at: Utc::now(),
            },
            (CallPhase::Active { connected_at }, CallTransition::Terminated { reason }) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                CallPhase::Ended {
                    outcome: classify(self.direction, true, reason),
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (
                CallPhase::Outgoing { .. }
                | CallPhase::IncomingRinging { .. }
                | CallPhase::Negotiating { .. },
                CallTransition::Terminated { reason },
            ) => CallPhase::Ended {
                outcome: classify(self.direction, false, reason),
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_phase: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.phase = new_phase;
        Ok(())
    }

    pub fn outcome(&self) -> Option<CallOutcome> {
        match &self.phase {
            CallPhase::Ended { outcome, .. } => Some(*outcome),
            _ => None,
        }
    }

    pub fn duration_secs(&self) -> Option<i64> {
        match &self.phase {
            CallPhase::Ended { duration_secs, .. } => *duration_secs,
            _ => None,
        }
    }
}

/// Outcome precedence: a call that reached Active is always `Answered`;
/// everything else is judged by direction and termination reason.
fn classify(
    direction: CallDirection,
    was_active: bool,
    reason: TerminationReason,
) -> CallOutcome {
    use TerminationReason::*;
    if was_active {
        return CallOutcome::Answered;
    }
    match direction {
        CallDirection::Outgoing => match reason {
            RingTimeout => CallOutcome::NoAnswer,
            PeerEnded => CallOutcome::Declined,
            _ => CallOutcome::Cancelled,
        },
        CallDirection::Incoming => match reason {
            LocalDecline | LocalHangup | MediaDenied | NegotiationFailed => CallOutcome::Declined,
            _ => CallOutcome::Missed,
        },
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_phase: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in phase {}",
            self.attempted, self.current_phase
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerInfo;

    fn make_outgoing_call() -> CallSession {
        CallSession::new_outgoing(PeerInfo::new(200, "Kai"), MediaKind::Audio)
    }

    fn make_incoming_call() -> CallSession {
        CallSession::new_incoming(PeerInfo::new(100, "Ada"), MediaKind::Video)
    }

    /// Flow: Outgoing → Negotiating → Active → Ended (answered)
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = make_outgoing_call();
        assert!(call.phase.is_ringing());
        assert!(call.is_initiator());

        call.apply_transition(CallTransition::RemoteAccepted)
            .unwrap();
        assert!(matches!(call.phase, CallPhase::Negotiating { .. }));

        call.apply_transition(CallTransition::MediaConnected)
            .unwrap();
        assert!(call.phase.is_active());

        call.apply_transition(CallTransition::Terminated {
            reason: TerminationReason::LocalHangup,
        })
        .unwrap();
        assert!(call.phase.is_ended());
        assert_eq!(call.outcome(), Some(CallOutcome::Answered));
        assert!(call.duration_secs().is_some());
    }

    /// Flow: IncomingRinging → Negotiating → Active → Ended (answered)
    #[test]
    fn test_incoming_call_flow() {
        let mut call = make_incoming_call();
        assert!(call.phase.can_accept());

        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        assert!(matches!(call.phase, CallPhase::Negotiating { .. }));

        call.apply_transition(CallTransition::MediaConnected)
            .unwrap();
        assert!(call.phase.is_active());

        call.apply_transition(CallTransition::Terminated {
            reason: TerminationReason::PeerEnded,
        })
        .unwrap();
        assert_eq!(call.outcome(), Some(CallOutcome::Answered));
    }

    #[test]
    fn test_unanswered_outgoing_is_no_answer() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::Terminated {
            reason: TerminationReason::RingTimeout,
        })
        .unwrap();
        assert_eq!(call.outcome(), Some(CallOutcome::NoAnswer));
        assert_eq!(call.duration_secs(), None);
    }

    #[test]
    fn test_cancelled_outgoing() {
        for reason in [
            TerminationReason::LocalHangup,
            TerminationReason::MediaDenied,
            TerminationReason::NegotiationFailed,
            TerminationReason::ConnectionLost,
            TerminationReason::RoomExpired,
            TerminationReason::Superseded,
        ] {
            let mut call = make_outgoing_call();
            call.apply_transition(CallTransition::Terminated { reason })
                .unwrap();
            assert_eq!(call.outcome(), Some(CallOutcome::Cancelled), "{reason:?}");
        }
    }

    #[test]
    fn test_peer_rejection_is_declined_for_caller() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::RemoteAccepted)
            .unwrap();
        call.apply_transition(CallTransition::Terminated {
            reason: TerminationReason::PeerEnded,
        })
        .unwrap();
        assert_eq!(call.outcome(), Some(CallOutcome::Declined));
    }

    #[test]
    fn test_incoming_decline_and_miss() {
        let mut declined = make_incoming_call();
        declined
            .apply_transition(CallTransition::Terminated {
                reason: TerminationReason::LocalDecline,
            })
            .unwrap();
        assert_eq!(declined.outcome(), Some(CallOutcome::Declined));

        for reason in [
            TerminationReason::PeerEnded,
            TerminationReason::ConnectionLost,
            TerminationReason::RoomExpired,
        ] {
            let mut missed = make_incoming_call();
            missed
                .apply_transition(CallTransition::Terminated { reason })
                .unwrap();
            assert_eq!(missed.outcome(), Some(CallOutcome::Missed), "{reason:?}");
        }
    }

    /// Capture failure after accepting still counts as a decline.
    #[test]
    fn test_incoming_media_denied_is_declined() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        call.apply_transition(CallTransition::Terminated {
            reason: TerminationReason::MediaDenied,
        })
        .unwrap();
        assert_eq!(call.outcome(), Some(CallOutcome::Declined));
    }

    /// Invalid state transitions are rejected.
    #[test]
    fn test_invalid_transitions() {
        let mut call = make_outgoing_call();

        // Can't locally accept our own outgoing call.
        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());

        // Can't connect media before the callee picked up.
        assert!(
            call.apply_transition(CallTransition::MediaConnected)
                .is_err()
        );

        let mut incoming = make_incoming_call();
        assert!(
            incoming
                .apply_transition(CallTransition::RemoteAccepted)
                .is_err()
        );
    }

    /// Ended sessions reject further transitions.
    #[test]
    fn test_ended_call_rejects_transitions() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::Terminated {
            reason: TerminationReason::LocalDecline,
        })
        .unwrap();
        assert!(call.phase.is_ended());

        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());
        assert!(
            call.apply_transition(CallTransition::MediaConnected)
                .is_err()
        );
        assert!(
            call.apply_transition(CallTransition::Terminated {
                reason: TerminationReason::PeerEnded,
            })
            .is_err()
        );
    }
}
