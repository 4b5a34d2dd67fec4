//! The call lifecycle actor.
//!
//! One task owns all call state. Channel events, negotiation events and
//! facade commands land in a single queue and are handled strictly in
//! order; nothing else may transition a session. Every exit path funnels
//! through [`CallMachine::teardown`], which releases resources, records
//! history and emits the concluding events exactly once.

use crate::call::session::{CallPhase, CallSession, CallTransition, TerminationReason};
use crate::channel::{ChannelEvent, SignalingChannel};
use crate::events::{
    CallConcluded, CallStateChanged, Connected, Disconnected, EventBus, IncomingRing, RoomClosed,
    RosterUpdate, SelfIdentified,
};
use crate::history::HistoryRecorder;
use crate::media::{MediaError, MediaSource};
use crate::negotiation::{
    MediaSessionFactory, NegotiationCoordinator, NegotiationError, NegotiationEvent,
    NegotiationRole,
};
use crate::presence::PresenceTracker;
use crate::protocol::{CandidateInit, ClientMessage, ServerMessage, SessionDesc};
use crate::types::{MediaKind, PeerId, PeerInfo};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("another call is already in progress")]
    Busy,
    #[error("no call in progress")]
    NoActiveCall,
    #[error("no ringing call to answer")]
    NotRinging,
    #[error("peer {0} is not available")]
    PeerUnavailable(PeerId),
    #[error("signaling channel is not connected")]
    ChannelDown,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("negotiation could not start: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("the call machine is gone")]
    MachineGone,
}

/// Facade gestures and queries. Replies travel on oneshot channels.
pub enum Command {
    PlaceCall {
        peer: PeerId,
        media: MediaKind,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Decline {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Hangup {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Roster {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    CurrentCall {
        reply: oneshot::Sender<Option<CallSession>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Everything that can land in the machine's queue.
pub enum Input {
    Channel(ChannelEvent),
    /// Tagged with the negotiation attempt that produced it; events from
    /// finished attempts are dropped.
    Negotiation {
        attempt: u64,
        event: NegotiationEvent,
    },
    Command(Command),
}

pub struct CallMachine {
    channel: Arc<SignalingChannel>,
    media_source: Arc<dyn MediaSource>,
    coordinator: NegotiationCoordinator,
    presence: PresenceTracker,
    history: Option<HistoryRecorder>,
    bus: Arc<EventBus>,
    self_id: Option<PeerId>,
    session: Option<CallSession>,
    local_media: Option<crate::media::LocalMedia>,
    attempt: u64,
    inputs: mpsc::Receiver<Input>,
    inputs_tx: mpsc::Sender<Input>,
}

impl CallMachine {
    pub fn new(
        channel: Arc<SignalingChannel>,
        media_source: Arc<dyn MediaSource>,
        session_factory: Arc<dyn MediaSessionFactory>,
        history: Option<HistoryRecorder>,
        bus: Arc<EventBus>,
        self_id: Option<PeerId>,
    ) -> (Self, mpsc::Sender<Input>) {
        let (inputs_tx, inputs) = mpsc::channel(64);
        let machine = Self {
            channel,
            media_source,
            coordinator: NegotiationCoordinator::new(session_factory),
            presence: PresenceTracker::new(),
            history,
            bus,
            self_id,
            session: None,
            local_media: None,
            attempt: 0,
            inputs,
            inputs_tx: inputs_tx.clone(),
        };
        (machine, inputs_tx)
    }

    pub async fn run(mut self) {
        info!(target: "Call", "Call machine started");
        while let Some(input) = self.inputs.recv().await {
            match input {
                Input::Channel(event) => self.on_channel_event(event).await,
                Input::Negotiation { attempt, event } => {
                    if attempt != self.attempt {
                        debug!(target: "Call", "Dropping event from a finished negotiation");
                        continue;
                    }
                    self.on_negotiation_event(event).await;
                }
                Input::Command(command) => {
                    if self.on_command(command).await {
                        break;
                    }
                }
            }
        }
        info!(target: "Call", "Call machine stopped");
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                let _ = self.bus.connected.send(Arc::new(Connected));
            }
            ChannelEvent::Message(message) => self.on_server_message(message).await,
            ChannelEvent::Lost => {
                self.presence.clear();
                let _ = self.bus.roster.send(Arc::new(RosterUpdate { peers: Vec::new() }));
                let _ = self.bus.disconnected.send(Arc::new(Disconnected));
                self.teardown(TerminationReason::ConnectionLost).await;
            }
            ChannelEvent::Failed(reason) => {
                self.presence.clear();
                self.teardown(TerminationReason::ConnectionLost).await;
                let _ = self.bus.room_closed.send(Arc::new(RoomClosed { reason }));
            }
        }
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Identity { id } => {
                debug!(target: "Call", "Relay assigned id {id}");
                self.self_id = Some(id.clone());
                let _ = self.bus.self_identified.send(Arc::new(SelfIdentified { id }));
            }
            ServerMessage::UserList(users) => {
                self.presence.apply_snapshot(users.clone());
                let _ = self.bus.roster.send(Arc::new(RosterUpdate { peers: users }));
            }
            ServerMessage::IncomingCall {
                from,
                from_user,
                call_type,
            } => self.on_incoming_call(from, from_user, call_type).await,
            ServerMessage::CallAccepted { from } => self.on_call_accepted(from).await,
            ServerMessage::Offer { from, sdp } => self.on_offer(from, sdp).await,
            ServerMessage::Answer { from, sdp } => self.on_answer(from, sdp).await,
            ServerMessage::Candidate { from, candidate } => {
                self.on_candidate(from, candidate).await
            }
            ServerMessage::CallEnded => {
                if self.session.is_some() {
                    self.teardown(TerminationReason::PeerEnded).await;
                } else {
                    debug!(target: "Call", "call_ended with no call in flight");
                }
            }
            ServerMessage::CallMissed => {
                let ringing_out = self
                    .session
                    .as_ref()
                    .is_some_and(|s| matches!(s.phase, CallPhase::Outgoing { .. }));
                if ringing_out {
                    self.teardown(TerminationReason::RingTimeout).await;
                } else {
                    debug!(target: "Call", "call_missed outside an outgoing ring");
                }
            }
            ServerMessage::RoomExpired => {
                info!(target: "Call", "Room expired; closing down");
                self.teardown(TerminationReason::RoomExpired).await;
                self.channel.shutdown().await;
                let _ = self.bus.room_closed.send(Arc::new(RoomClosed {
                    reason: "room lifetime expired".to_string(),
                }));
            }
            ServerMessage::Unknown => {}
        }
    }

    async fn on_incoming_call(&mut self, from: PeerId, from_user: PeerInfo, media: MediaKind) {
        let existing = self
            .session
            .as_ref()
            .map(|s| (s.peer.id.clone(), matches!(s.phase, CallPhase::Outgoing { .. })));
        match existing {
            None => self.ring(from_user, media),
            Some((peer, true)) if peer == from => {
                // Both sides dialed each other. The lower id yields and
                // takes the callee side; an unknown self id yields too.
                if self.wins_glare(&from) {
                    warn!(target: "Call", "Simultaneous call with {from}; staying caller");
                    return;
                }
                info!(target: "Call", "Simultaneous call with {from}; yielding to their ring");
                self.teardown(TerminationReason::Superseded).await;
                self.ring(from_user, media);
            }
            Some(_) => {
                info!(
                    target: "Call",
                    "Busy; declining call from {}",
                    from_user.display_name()
                );
                self.channel
                    .send(&ClientMessage::CallDeclined { target_id: from })
                    .await;
            }
        }
    }

    fn wins_glare(&self, from: &PeerId) -> bool {
        match &self.self_id {
            Some(me) => me > from,
            None => false,
        }
    }

    fn ring(&mut self, peer: PeerInfo, media: MediaKind) {
        info!(
            target: "Call",
            "Incoming {media:?} call from {}",
            peer.display_name()
        );
        let session = CallSession::new_incoming(peer.clone(), media);
        let _ = self.bus.incoming_ring.send(Arc::new(IncomingRing { peer, media }));
        self.session = Some(session);
        self.emit_state();
    }

    async fn on_call_accepted(&mut self, from: PeerId) {
        let Some(session) = self.session.as_mut() else {
            debug!(target: "Call", "call_accepted with no call in flight");
            return;
        };
        if session.peer.id != from {
            warn!(target: "Call", "call_accepted from {from}, expected {}", session.peer.id);
            return;
        }
        if let Err(e) = session.apply_transition(CallTransition::RemoteAccepted) {
            warn!(target: "Call", "Ignoring call_accepted: {e}");
            return;
        }
        self.emit_state();
        let offer = match self.start_negotiation(NegotiationRole::Initiator).await {
            Ok(()) => self.coordinator.create_offer().await,
            Err(e) => Err(e),
        };
        match offer {
            Ok(sdp) => {
                self.channel
                    .send(&ClientMessage::Offer {
                        target_id: from,
                        sdp,
                    })
                    .await;
            }
            Err(e) => {
                warn!(target: "Call", "Offer creation failed: {e}");
                self.teardown(TerminationReason::NegotiationFailed).await;
            }
        }
    }

    async fn on_offer(&mut self, from: PeerId, sdp: SessionDesc) {
        if !self.peer_matches(&from) {
            warn!(target: "Call", "Dropping offer from {from}: no call with them");
            return;
        }
        // Descriptions are only legal mid-negotiation; a stable engine
        // connection treats them as failures.
        if !self.negotiating() || self.coordinator.role() != Some(NegotiationRole::Responder) {
            warn!(target: "Call", "Dropping offer from {from}: not answering them");
            return;
        }
        match self.coordinator.apply_remote_offer(sdp).await {
            Ok(answer) => {
                self.channel
                    .send(&ClientMessage::Answer {
                        target_id: from,
                        sdp: answer,
                    })
                    .await;
                self.mark_connected();
            }
            Err(e) => {
                warn!(target: "Call", "Could not apply remote offer: {e}");
                self.teardown(TerminationReason::NegotiationFailed).await;
            }
        }
    }

    async fn on_answer(&mut self, from: PeerId, sdp: SessionDesc) {
        if !self.peer_matches(&from) {
            warn!(target: "Call", "Dropping answer from {from}: no call with them");
            return;
        }
        if !self.negotiating() || self.coordinator.role() != Some(NegotiationRole::Initiator) {
            warn!(target: "Call", "Dropping answer from {from}: not calling them");
            return;
        }
        match self.coordinator.apply_remote_answer(sdp).await {
            Ok(()) => self.mark_connected(),
            Err(e) => {
                warn!(target: "Call", "Could not apply remote answer: {e}");
                self.teardown(TerminationReason::NegotiationFailed).await;
            }
        }
    }

    async fn on_candidate(&mut self, from: PeerId, candidate: CandidateInit) {
        if !self.peer_matches(&from) {
            warn!(target: "Call", "Dropping ICE candidate from {from}: no call with them");
            return;
        }
        self.coordinator.apply_remote_candidate(candidate).await;
    }

    async fn on_negotiation_event(&mut self, event: NegotiationEvent) {
        match event {
            NegotiationEvent::LocalCandidate(candidate) => {
                let Some(target) = self.session.as_ref().map(|s| s.peer.id.clone()) else {
                    return;
                };
                self.channel
                    .send(&ClientMessage::Candidate {
                        target_id: target,
                        candidate,
                    })
                    .await;
            }
            NegotiationEvent::ConnectionFailed(reason) => {
                warn!(target: "Call", "Media path failed: {reason}");
                self.teardown(TerminationReason::NegotiationFailed).await;
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::PlaceCall { peer, media, reply } => {
                let _ = reply.send(self.place_call(peer, media).await);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept().await);
            }
            Command::Decline { reply } => {
                let _ = reply.send(self.decline().await);
            }
            Command::Hangup { reply } => {
                let _ = reply.send(self.hangup().await);
            }
            Command::Roster { reply } => {
                let _ = reply.send(self.presence.roster().to_vec());
            }
            Command::CurrentCall { reply } => {
                let _ = reply.send(self.session.clone());
            }
            Command::Shutdown { reply } => {
                if self.session.is_some() {
                    self.teardown(TerminationReason::LocalHangup).await;
                }
                self.channel.shutdown().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn place_call(&mut self, peer: PeerId, media: MediaKind) -> Result<(), CallError> {
        if self.session.is_some() {
            return Err(CallError::Busy);
        }
        if !self.channel.is_connected() {
            return Err(CallError::ChannelDown);
        }
        let Some(info) = self.presence.get(&peer).cloned() else {
            return Err(CallError::PeerUnavailable(peer));
        };
        if !info.is_available() {
            return Err(CallError::PeerUnavailable(peer));
        }
        // Capture before anything touches the wire, so a refusal leaves
        // no trace: no message, no session, no history entry.
        let local = self.media_source.capture(media).await?;
        self.local_media = Some(local);
        self.channel
            .send(&ClientMessage::CallUser {
                target_id: peer,
                call_type: media,
            })
            .await;
        info!(target: "Call", "Calling {} ({media:?})", info.display_name());
        self.session = Some(CallSession::new_outgoing(info, media));
        self.emit_state();
        Ok(())
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let (peer, media) = match self.session.as_ref() {
            None => return Err(CallError::NoActiveCall),
            Some(s) if !s.phase.can_accept() => return Err(CallError::NotRinging),
            Some(s) => (s.peer.id.clone(), s.media),
        };
        let local = match self.media_source.capture(media).await {
            Ok(local) => local,
            Err(e) => {
                warn!(target: "Call", "Capture failed, declining the call: {e}");
                self.teardown(TerminationReason::MediaDenied).await;
                return Err(e.into());
            }
        };
        self.local_media = Some(local);
        self.channel
            .send(&ClientMessage::CallAccepted { target_id: peer })
            .await;
        if let Some(session) = self.session.as_mut()
            && let Err(e) = session.apply_transition(CallTransition::LocalAccepted)
        {
            warn!(target: "Call", "{e}");
        }
        self.emit_state();
        if let Err(e) = self.start_negotiation(NegotiationRole::Responder).await {
            warn!(target: "Call", "Could not start negotiation: {e}");
            self.teardown(TerminationReason::NegotiationFailed).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn decline(&mut self) -> Result<(), CallError> {
        match self.session.as_ref() {
            None => Err(CallError::NoActiveCall),
            Some(s) if !s.phase.can_decline() => Err(CallError::NotRinging),
            Some(_) => {
                self.teardown(TerminationReason::LocalDecline).await;
                Ok(())
            }
        }
    }

    async fn hangup(&mut self) -> Result<(), CallError> {
        match self.session.as_ref() {
            None => Err(CallError::NoActiveCall),
            // Ending a call that is still ringing in is a decline.
            Some(s) if s.phase.can_decline() => {
                self.teardown(TerminationReason::LocalDecline).await;
                Ok(())
            }
            Some(_) => {
                self.teardown(TerminationReason::LocalHangup).await;
                Ok(())
            }
        }
    }

    async fn start_negotiation(&mut self, role: NegotiationRole) -> Result<(), NegotiationError> {
        let Some(media) = self.local_media.as_ref() else {
            return Err(NegotiationError::Engine("no local media captured".to_string()));
        };
        self.attempt += 1;
        let attempt = self.attempt;
        let (neg_tx, mut neg_rx) = mpsc::channel(16);
        self.coordinator.begin(role, media, neg_tx).await?;
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = neg_rx.recv().await {
                if inputs
                    .send(Input::Negotiation { attempt, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(())
    }

    fn peer_matches(&self, from: &PeerId) -> bool {
        self.session.as_ref().is_some_and(|s| &s.peer.id == from)
    }

    fn negotiating(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.phase.is_negotiating())
    }

    fn mark_connected(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.apply_transition(CallTransition::MediaConnected) {
                warn!(target: "Call", "{e}");
                return;
            }
            info!(target: "Call", "Call with {} is up", session.peer.display_name());
        }
        self.emit_state();
    }

    fn emit_state(&self) {
        if let Some(session) = &self.session {
            let _ = self.bus.call_state.send(Arc::new(CallStateChanged {
                session: session.clone(),
            }));
        }
    }

    /// The single exit path. Sends the wire message the reason calls for,
    /// releases negotiation and capture resources, classifies the outcome,
    /// records history and emits the concluding events. A second call is
    /// a no-op.
    async fn teardown(&mut self, reason: TerminationReason) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        // Anything still in flight from this attempt is now stale.
        self.attempt += 1;
        match reason {
            TerminationReason::LocalHangup | TerminationReason::NegotiationFailed => {
                self.channel
                    .send(&ClientMessage::Hangup {
                        target_id: session.peer.id.clone(),
                    })
                    .await;
            }
            TerminationReason::LocalDecline | TerminationReason::MediaDenied => {
                self.channel
                    .send(&ClientMessage::CallDeclined {
                        target_id: session.peer.id.clone(),
                    })
                    .await;
            }
            _ => {}
        }
        self.coordinator.close().await;
        if let Some(mut media) = self.local_media.take() {
            media.stop();
        }
        if let Err(e) = session.apply_transition(CallTransition::Terminated { reason }) {
            warn!(target: "Call", "Teardown on a finished session: {e}");
        }
        if let Some(outcome) = session.outcome() {
            info!(
                target: "Call",
                "Call with {} concluded: {outcome:?} ({reason:?})",
                session.peer.display_name()
            );
            if let Some(recorder) = &self.history {
                recorder.record(&session);
            }
            let _ = self.bus.call_concluded.send(Arc::new(CallConcluded {
                session: session.clone(),
                reason,
                outcome,
            }));
        }
        let _ = self.bus.call_state.send(Arc::new(CallStateChanged { session }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::session::CallOutcome;
    use crate::channel::transport::mock::MockTransportFactory;
    use crate::history::HistoryRecorder;
    use crate::history::mock::MemoryHistory;
    use crate::media::mock::{DeniedMediaSource, NullMediaSource};
    use crate::negotiation::mock::MockMediaSessionFactory;
    use crate::types::{Availability, CallDirection};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Rig {
        machine: CallMachine,
        wire: Arc<MockTransportFactory>,
        engine: Arc<MockMediaSessionFactory>,
        history: Arc<MemoryHistory>,
        bus: Arc<EventBus>,
    }

    async fn rig_with(media_source: Arc<dyn MediaSource>, self_id: Option<PeerId>) -> Rig {
        let wire = Arc::new(MockTransportFactory::default());
        let channel =
            SignalingChannel::new("ws://rig.test/ws", Duration::from_millis(10), wire.clone());
        let (tx, mut channel_events) = mpsc::channel(64);
        channel.spawn(tx);
        let first = timeout(Duration::from_millis(500), channel_events.recv())
            .await
            .expect("no channel event")
            .expect("channel closed");
        assert!(matches!(first, ChannelEvent::Connected));
        // These tests drive the machine handlers directly; the channel's
        // event stream is not needed past the connect handshake.
        drop(channel_events);

        let history = Arc::new(MemoryHistory::default());
        let bus = Arc::new(EventBus::new());
        let engine = Arc::new(MockMediaSessionFactory::default());
        let (machine, _inputs) = CallMachine::new(
            channel,
            media_source,
            engine.clone(),
            Some(HistoryRecorder::new(history.clone())),
            bus.clone(),
            self_id,
        );
        Rig {
            machine,
            wire,
            engine,
            history,
            bus,
        }
    }

    async fn rig() -> Rig {
        rig_with(Arc::new(NullMediaSource), Some(PeerId::Num(1))).await
    }

    fn user(id: i64, name: &str) -> PeerInfo {
        PeerInfo::new(id, name)
    }

    async fn sent_kinds(rig: &Rig) -> Vec<String> {
        let conn = rig.wire.last_connection().await;
        conn.transport
            .sent_messages()
            .await
            .iter()
            .map(|raw| {
                serde_json::from_str::<serde_json::Value>(raw).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    async fn wait_for_history(history: &MemoryHistory, n: usize) {
        for _ in 0..50 {
            if history.recorded().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("history never reached {n} entries");
    }

    async fn dial(rig: &mut Rig, peer_id: i64) {
        rig.machine
            .on_server_message(ServerMessage::UserList(vec![
                user(1, "Me"),
                user(peer_id, "Kai"),
            ]))
            .await;
        rig.machine
            .place_call(PeerId::Num(peer_id), MediaKind::Audio)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn busy_callee_declines_second_caller() {
        let mut rig = rig().await;
        rig.machine
            .on_incoming_call(PeerId::Num(2), user(2, "Kai"), MediaKind::Audio)
            .await;
        rig.machine
            .on_incoming_call(PeerId::Num(3), user(3, "Ada"), MediaKind::Video)
            .await;

        assert_eq!(sent_kinds(&rig).await, vec!["call_declined"]);
        let session = rig.machine.session.as_ref().unwrap();
        assert_eq!(session.peer.id, PeerId::Num(2));
        assert!(session.phase.can_accept());
    }

    #[tokio::test]
    async fn same_peer_glare_lower_id_yields() {
        let mut rig = rig().await;
        let mut concluded = rig.bus.call_concluded.subscribe();
        dial(&mut rig, 2).await;

        rig.machine
            .on_incoming_call(PeerId::Num(2), user(2, "Kai"), MediaKind::Audio)
            .await;

        // The outgoing attempt ends Cancelled, with nothing on the wire
        // beyond the original dial.
        let ended = concluded.recv().await.unwrap();
        assert_eq!(ended.outcome, CallOutcome::Cancelled);
        assert_eq!(ended.reason, TerminationReason::Superseded);
        assert_eq!(sent_kinds(&rig).await, vec!["call_user"]);

        let session = rig.machine.session.as_ref().unwrap();
        assert_eq!(session.direction, CallDirection::Incoming);
        assert!(session.phase.can_accept());
    }

    #[tokio::test]
    async fn same_peer_glare_higher_id_stays_caller() {
        let mut rig = rig_with(Arc::new(NullMediaSource), Some(PeerId::Num(9))).await;
        dial(&mut rig, 2).await;

        rig.machine
            .on_incoming_call(PeerId::Num(2), user(2, "Kai"), MediaKind::Audio)
            .await;

        let session = rig.machine.session.as_ref().unwrap();
        assert_eq!(session.direction, CallDirection::Outgoing);
        assert_eq!(sent_kinds(&rig).await, vec!["call_user"]);
    }

    #[tokio::test]
    async fn ring_timeout_concludes_no_answer() {
        let mut rig = rig().await;
        dial(&mut rig, 2).await;

        rig.machine.on_server_message(ServerMessage::CallMissed).await;

        assert!(rig.machine.session.is_none());
        wait_for_history(&rig.history, 1).await;
        let entry = &rig.history.recorded()[0];
        assert_eq!(entry.outcome, CallOutcome::NoAnswer);
        assert_eq!(entry.duration, None);
    }

    #[tokio::test]
    async fn capture_refusal_leaves_no_trace() {
        let mut rig = rig_with(Arc::new(DeniedMediaSource), Some(PeerId::Num(1))).await;
        rig.machine
            .on_server_message(ServerMessage::UserList(vec![user(2, "Kai")]))
            .await;

        let err = rig
            .machine
            .place_call(PeerId::Num(2), MediaKind::Video)
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Media(_)));
        assert!(rig.machine.session.is_none());
        assert!(sent_kinds(&rig).await.is_empty());
        assert!(rig.history.recorded().is_empty());
    }

    #[tokio::test]
    async fn calling_a_busy_peer_is_refused_locally() {
        let mut rig = rig().await;
        let mut busy = user(2, "Kai");
        busy.status = Availability::Busy;
        rig.machine
            .on_server_message(ServerMessage::UserList(vec![busy]))
            .await;

        let err = rig
            .machine
            .place_call(PeerId::Num(2), MediaKind::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::PeerUnavailable(_)));
        assert!(sent_kinds(&rig).await.is_empty());
    }

    #[tokio::test]
    async fn accept_flow_answers_the_offer() {
        let mut rig = rig().await;
        rig.machine
            .on_incoming_call(PeerId::Num(2), user(2, "Kai"), MediaKind::Audio)
            .await;
        rig.machine.accept().await.unwrap();
        rig.machine
            .on_offer(PeerId::Num(2), SessionDesc::offer("v=0\r\npeer"))
            .await;

        assert_eq!(sent_kinds(&rig).await, vec!["call_accepted", "answer"]);
        let session = rig.machine.session.as_ref().unwrap();
        assert!(session.phase.is_active());
    }

    #[tokio::test]
    async fn peer_hangup_before_answer_is_missed() {
        let mut rig = rig().await;
        rig.machine
            .on_incoming_call(PeerId::Num(2), user(2, "Kai"), MediaKind::Audio)
            .await;

        rig.machine.on_server_message(ServerMessage::CallEnded).await;

        assert!(rig.machine.session.is_none());
        wait_for_history(&rig.history, 1).await;
        assert_eq!(rig.history.recorded()[0].outcome, CallOutcome::Missed);
    }

    #[tokio::test]
    async fn hangup_while_ringing_in_declines() {
        let mut rig = rig().await;
        rig.machine
            .on_incoming_call(PeerId::Num(2), user(2, "Kai"), MediaKind::Audio)
            .await;

        rig.machine.hangup().await.unwrap();

        assert_eq!(sent_kinds(&rig).await, vec!["call_declined"]);
        wait_for_history(&rig.history, 1).await;
        assert_eq!(rig.history.recorded()[0].outcome, CallOutcome::Declined);
    }

    #[tokio::test]
    async fn lost_channel_clears_roster_and_call() {
        let mut rig = rig().await;
        dial(&mut rig, 2).await;

        rig.machine.on_channel_event(ChannelEvent::Lost).await;

        assert!(rig.machine.session.is_none());
        assert!(rig.machine.presence.roster().is_empty());
        wait_for_history(&rig.history, 1).await;
        assert_eq!(rig.history.recorded()[0].outcome, CallOutcome::Cancelled);
    }

    #[tokio::test]
    async fn stray_negotiation_messages_are_dropped() {
        let mut rig = rig().await;
        // No call at all: offer, answer and candidate must all be inert.
        rig.machine
            .on_offer(PeerId::Num(2), SessionDesc::offer("v=0\r\npeer"))
            .await;
        rig.machine
            .on_answer(PeerId::Num(2), SessionDesc::answer("v=0\r\npeer"))
            .await;
        rig.machine
            .on_candidate(PeerId::Num(2), CandidateInit::default())
            .await;

        assert!(rig.machine.session.is_none());
        assert!(sent_kinds(&rig).await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_terminal_signals_conclude_once() {
        let mut rig = rig().await;
        dial(&mut rig, 2).await;

        // Ring timeout first; the peer's late decline then arrives as
        // call_ended, twice, and a local hangup trails behind.
        rig.machine.on_server_message(ServerMessage::CallMissed).await;
        rig.machine.on_server_message(ServerMessage::CallEnded).await;
        rig.machine.on_server_message(ServerMessage::CallEnded).await;
        let err = rig.machine.hangup().await.unwrap_err();

        assert!(matches!(err, CallError::NoActiveCall));
        assert!(rig.machine.session.is_none());
        wait_for_history(&rig.history, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let recorded = rig.history.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].outcome, CallOutcome::NoAnswer);
        assert_eq!(sent_kinds(&rig).await, vec!["call_user"]);
    }

    #[tokio::test]
    async fn descriptions_after_connect_are_ignored() {
        let mut rig = rig().await;
        dial(&mut rig, 2).await;
        rig.machine
            .on_server_message(ServerMessage::CallAccepted {
                from: PeerId::Num(2),
            })
            .await;
        rig.machine
            .on_answer(PeerId::Num(2), SessionDesc::answer("v=0\r\npeer"))
            .await;
        assert!(rig.machine.session.as_ref().unwrap().phase.is_active());

        // A repeated answer or a late offer from the in-call peer must
        // never reach the engine.
        rig.machine
            .on_answer(PeerId::Num(2), SessionDesc::answer("v=0\r\nagain"))
            .await;
        rig.machine
            .on_offer(PeerId::Num(2), SessionDesc::offer("v=0\r\nlate"))
            .await;

        let session = rig.machine.session.as_ref().unwrap();
        assert!(session.phase.is_active());
        assert_eq!(
            rig.engine.last_session().calls().await,
            vec!["create_offer", "apply_remote_answer:answer"]
        );
        assert!(rig.history.recorded().is_empty());
        assert_eq!(sent_kinds(&rig).await, vec!["call_user", "offer"]);
    }
}
