//! Wire protocol of the signaling relay.
//!
//! Every frame is a JSON envelope `{"type": ..., "data": ...}`. Inbound and
//! outbound sets are disjoint: the relay rewrites client messages before
//! forwarding (e.g. a peer's `hangup` or `call_declined` arrives here as a
//! bare `call_ended`), so the two directions get separate enums.

use crate::types::{MediaKind, PeerId, PeerInfo};
use serde::{Deserialize, Serialize};

/// Browser-shaped session description, as `RTCSessionDescription` JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDesc {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDesc {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == "offer"
    }

    pub fn is_answer(&self) -> bool {
        self.kind == "answer"
    }
}

/// Browser-shaped ICE candidate, as `RTCIceCandidate.toJSON()`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Messages the relay sends to this client.
///
/// `Offer`/`Answer`/`Candidate` are peer messages forwarded verbatim with a
/// relay-injected `from`; the peer's own `target_id` still rides along and is
/// ignored here. Decode frames through [`ServerMessage::parse`]: a tag this
/// build has no variant for maps to [`ServerMessage::Unknown`] whatever its
/// payload, so a newer relay never kills the read loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Identity {
        id: PeerId,
    },
    UserList(Vec<PeerInfo>),
    IncomingCall {
        from: PeerId,
        from_user: PeerInfo,
        call_type: MediaKind,
    },
    CallAccepted {
        from: PeerId,
    },
    Offer {
        from: PeerId,
        sdp: SessionDesc,
    },
    Answer {
        from: PeerId,
        sdp: SessionDesc,
    },
    Candidate {
        from: PeerId,
        candidate: CandidateInit,
    },
    CallEnded,
    CallMissed,
    RoomExpired,
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Decodes one relay frame, tolerating foreign message types. A known
    /// tag with a payload that does not fit is still an error.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<Self>(text) {
            Ok(message) => Ok(message),
            Err(err) => {
                // The serde(other) fallback only accepts dataless frames; a
                // foreign tag carrying a payload lands here. Decode the tag
                // alone to tell it from a known-but-mangled frame.
                #[derive(Deserialize)]
                struct TagOnly {
                    #[serde(rename = "type")]
                    tag: String,
                }
                let Ok(TagOnly { tag }) = serde_json::from_str::<TagOnly>(text) else {
                    return Err(err);
                };
                match serde_json::from_value::<Self>(serde_json::json!({ "type": tag })) {
                    Ok(Self::Unknown) => Ok(Self::Unknown),
                    _ => Err(err),
                }
            }
        }
    }
}

/// Messages this client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    CallUser {
        target_id: PeerId,
        call_type: MediaKind,
    },
    CallAccepted {
        target_id: PeerId,
    },
    CallDeclined {
        target_id: PeerId,
    },
    Offer {
        target_id: PeerId,
        sdp: SessionDesc,
    },
    Answer {
        target_id: PeerId,
        sdp: SessionDesc,
    },
    Candidate {
        target_id: PeerId,
        candidate: CandidateInit,
    },
    Hangup {
        target_id: PeerId,
    },
}

impl ClientMessage {
    /// Wire tag, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CallUser { .. } => "call_user",
            ClientMessage::CallAccepted { .. } => "call_accepted",
            ClientMessage::CallDeclined { .. } => "call_declined",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::Candidate { .. } => "candidate",
            ClientMessage::Hangup { .. } => "hangup",
        }
    }
}
