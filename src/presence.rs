use crate::types::{Availability, PeerId, PeerInfo};
use log::debug;

/// Roster of everyone currently connected to the room, self included.
///
/// The relay rebroadcasts the full list on every join, leave and status
/// flip; each snapshot wholesale-replaces the previous one. There is no
/// incremental diffing and no memory of peers that have left.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    roster: Vec<PeerInfo>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_snapshot(&mut self, users: Vec<PeerInfo>) {
        debug!(
            "roster snapshot: {} user(s), {} available",
            users.len(),
            users.iter().filter(|u| u.is_available()).count()
        );
        self.roster = users;
    }

    /// Dropped connection means every peer is unreachable until the relay
    /// sends a fresh snapshot.
    pub fn clear(&mut self) {
        self.roster.clear();
    }

    pub fn roster(&self) -> &[PeerInfo] {
        &self.roster
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerInfo> {
        self.roster.iter().find(|u| &u.id == id)
    }

    /// Peers absent from the snapshot are offline, not an error.
    pub fn availability(&self, id: &PeerId) -> Availability {
        self.get(id).map_or(Availability::Offline, |u| u.status)
    }
}
