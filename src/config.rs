use crate::types::PeerId;
use std::time::Duration;

/// Fixed redial delay after a retryable connection loss.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Which relay room this client joins, and under which identity.
///
/// Group rooms authenticate with the platform init-data blob and carry a
/// stable user identity, so call history applies to them. Private link
/// rooms are anonymous; the relay assigns a throwaway id on connect.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomContext {
    Group {
        chat_id: String,
        init_data: String,
        self_id: PeerId,
    },
    Private {
        room_id: String,
    },
}

impl RoomContext {
    pub fn is_identity_bearing(&self) -> bool {
        matches!(self, RoomContext::Group { .. })
    }

    /// Self id known up front. Private rooms learn theirs from the relay's
    /// `identity` message instead.
    pub fn self_id(&self) -> Option<&PeerId> {
        match self {
            RoomContext::Group { self_id, .. } => Some(self_id),
            RoomContext::Private { .. } => None,
        }
    }

    fn ws_path(&self) -> String {
        match self {
            RoomContext::Group {
                chat_id, init_data, ..
            } => format!("/ws/tg/{}/{}", chat_id, urlencoding::encode(init_data)),
            RoomContext::Private { room_id } => format!("/ws/private/{room_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Relay origin, scheme included (`https://…` or `wss://…`).
    pub base_url: String,
    pub room: RoomContext,
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, room: RoomContext) -> Self {
        Self {
            base_url: base_url.into(),
            room,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    /// WebSocket endpoint for this room.
    pub fn ws_url(&self) -> String {
        format!("{}{}", to_ws_origin(&self.base_url), self.room.ws_path())
    }

    /// History endpoint, only meaningful for identity-bearing rooms.
    pub fn history_url(&self) -> Option<String> {
        match &self.room {
            RoomContext::Group { init_data, .. } => Some(format!(
                "{}/history/{}",
                to_http_origin(&self.base_url),
                urlencoding::encode(init_data)
            )),
            RoomContext::Private { .. } => None,
        }
    }
}

fn to_ws_origin(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    }
}

fn to_http_origin(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = base.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        base.to_string()
    }
}
