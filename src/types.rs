use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque peer identifier. The relay hands out numeric ids in group rooms
/// and UUID strings in private rooms; both must round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerId {
    Num(i64),
    Str(String),
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::Num(n) => write!(f, "{n}"),
            PeerId::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for PeerId {
    fn from(n: i64) -> Self {
        PeerId::Num(n)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId::Str(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId::Str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    Busy,
    /// Not present in any roster snapshot. Never sent by the relay.
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Video calls always carry an audio track as well.
    pub fn has_video(self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// One entry of the relay's roster snapshot. Unknown fields from the
/// platform user object are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default = "default_status")]
    pub status: Availability,
}

fn default_status() -> Availability {
    Availability::Available
}

impl PeerInfo {
    pub fn new(id: impl Into<PeerId>, first_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            first_name: first_name.into(),
            last_name: String::new(),
            username: None,
            status: Availability::Available,
        }
    }

    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let trimmed = full.trim();
        if trimmed.is_empty() {
            self.id.to_string()
        } else {
            trimmed.to_string()
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == Availability::Available
    }
}
