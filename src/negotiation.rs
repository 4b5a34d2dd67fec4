//! Offer/answer/ICE bookkeeping for one call attempt.
//!
//! The coordinator wraps a [`MediaSession`] (the engine seam implemented
//! in [`crate::rtc`]) and enforces the ordering rules the engine cares
//! about: local tracks exist before the first description, the remote
//! description lands before any remote candidate, and a new attempt never
//! inherits engine state from a previous one.

use crate::media::LocalMedia;
use crate::protocol::{CandidateInit, SessionDesc};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// We called; we produce the offer.
    Initiator,
    /// We were called; we answer the peer's offer.
    Responder,
}

/// Emitted by the engine while a session is live.
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    /// Trickle ICE: a local candidate to forward to the peer.
    LocalCandidate(CandidateInit),
    /// The media path failed after setup (late ICE failure).
    ConnectionFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("media engine error: {0}")]
    Engine(String),
    #[error("bad session description: {0}")]
    Sdp(String),
    #[error("bad ICE candidate: {0}")]
    Candidate(String),
    #[error("no negotiation in progress")]
    NoSession,
}

/// One engine-side media session (a peer connection, in practice).
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDesc, NegotiationError>;

    /// Applies the peer's offer and returns our answer.
    async fn apply_remote_offer(&self, offer: SessionDesc)
    -> Result<SessionDesc, NegotiationError>;

    async fn apply_remote_answer(&self, answer: SessionDesc) -> Result<(), NegotiationError>;

    async fn add_remote_candidate(&self, candidate: CandidateInit)
    -> Result<(), NegotiationError>;

    async fn close(&self);
}

/// Creates engine sessions with the local tracks already attached, so
/// they are part of the very first offer.
#[async_trait]
pub trait MediaSessionFactory: Send + Sync {
    async fn create_session(
        &self,
        media: &LocalMedia,
        events: mpsc::Sender<NegotiationEvent>,
    ) -> Result<Arc<dyn MediaSession>, NegotiationError>;
}

pub struct NegotiationCoordinator {
    factory: Arc<dyn MediaSessionFactory>,
    session: Option<Arc<dyn MediaSession>>,
    role: Option<NegotiationRole>,
    remote_described: bool,
    pending_candidates: Vec<CandidateInit>,
}

impl NegotiationCoordinator {
    pub fn new(factory: Arc<dyn MediaSessionFactory>) -> Self {
        Self {
            factory,
            session: None,
            role: None,
            remote_described: false,
            pending_candidates: Vec::new(),
        }
    }

    /// Starts a fresh attempt. Any stale session from an earlier attempt
    /// is closed and replaced, never reused.
    pub async fn begin(
        &mut self,
        role: NegotiationRole,
        media: &LocalMedia,
        events: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), NegotiationError> {
        if let Some(stale) = self.session.take() {
            warn!("Replacing stale media session");
            stale.close().await;
        }
        self.remote_described = false;
        self.pending_candidates.clear();
        self.role = Some(role);
        self.session = Some(self.factory.create_session(media, events).await?);
        Ok(())
    }

    pub fn role(&self) -> Option<NegotiationRole> {
        self.role
    }

    pub fn in_progress(&self) -> bool {
        self.session.is_some()
    }

    pub async fn create_offer(&self) -> Result<SessionDesc, NegotiationError> {
        let session = self.session.as_ref().ok_or(NegotiationError::NoSession)?;
        session.create_offer().await
    }

    pub async fn apply_remote_offer(
        &mut self,
        offer: SessionDesc,
    ) -> Result<SessionDesc, NegotiationError> {
        let session = self
            .session
            .as_ref()
            .ok_or(NegotiationError::NoSession)?
            .clone();
        let answer = session.apply_remote_offer(offer).await?;
        self.remote_described = true;
        self.flush_pending().await;
        Ok(answer)
    }

    pub async fn apply_remote_answer(&mut self, answer: SessionDesc) -> Result<(), NegotiationError> {
        let session = self
            .session
            .as_ref()
            .ok_or(NegotiationError::NoSession)?
            .clone();
        session.apply_remote_answer(answer).await?;
        self.remote_described = true;
        self.flush_pending().await;
        Ok(())
    }

    /// Candidates are advisory: one arriving before the session exists is
    /// a peer/relay protocol slip and is dropped; one arriving before the
    /// remote description is held back and applied later in arrival
    /// order; a candidate the engine rejects is skipped, not fatal.
    pub async fn apply_remote_candidate(&mut self, candidate: CandidateInit) {
        let Some(session) = self.session.as_ref() else {
            warn!("Dropping ICE candidate: no negotiation in progress");
            return;
        };
        if !self.remote_described {
            debug!("Holding ICE candidate until the remote description lands");
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = session.add_remote_candidate(candidate).await {
            warn!("Rejected remote candidate: {e}");
        }
    }

    async fn flush_pending(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = session.add_remote_candidate(candidate).await {
                warn!("Rejected held-back candidate: {e}");
            }
        }
    }

    /// Idempotent. Forgets every piece of attempt state and releases the
    /// engine session.
    pub async fn close(&mut self) {
        self.role = None;
        self.remote_described = false;
        self.pending_candidates.clear();
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}
