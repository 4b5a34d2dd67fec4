//! The embedder-facing facade.
//!
//! `CallClientBuilder` wires the channel, the call machine and the
//! injected seams together and spawns their tasks; `CallClient` turns
//! method calls into machine commands and exposes the event bus for
//! observers. The client holds no call state of its own.

use crate::call::machine::{CallError, CallMachine, Command, Input};
use crate::call::session::CallSession;
use crate::channel::SignalingChannel;
use crate::channel::transport::{TransportFactory, WsTransportFactory};
use crate::config::ClientConfig;
use crate::events::EventBus;
use crate::history::{
    HistoryBackend, HistoryEntry, HistoryError, HistoryRecorder, HttpHistoryStore,
};
use crate::media::{MediaSource, SampleMediaSource};
use crate::negotiation::MediaSessionFactory;
use crate::rtc::RtcSessionFactory;
use crate::types::{MediaKind, PeerId, PeerInfo};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub struct CallClientBuilder {
    config: ClientConfig,
    transport_factory: Arc<dyn TransportFactory>,
    media_source: Arc<dyn MediaSource>,
    session_factory: Arc<dyn MediaSessionFactory>,
    history_backend: Option<Arc<dyn HistoryBackend>>,
}

impl CallClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport_factory: Arc::new(WsTransportFactory::new()),
            media_source: Arc::new(SampleMediaSource::new()),
            session_factory: Arc::new(RtcSessionFactory::new()),
            history_backend: None,
        }
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn media_source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.media_source = source;
        self
    }

    pub fn session_factory(mut self, factory: Arc<dyn MediaSessionFactory>) -> Self {
        self.session_factory = factory;
        self
    }

    pub fn history_backend(mut self, backend: Arc<dyn HistoryBackend>) -> Self {
        self.history_backend = Some(backend);
        self
    }

    /// Spawns the channel and machine tasks and hands back the facade.
    /// The channel starts dialing immediately.
    pub fn connect(self) -> CallClient {
        let bus = Arc::new(EventBus::new());
        let channel = SignalingChannel::new(
            self.config.ws_url(),
            self.config.reconnect_delay,
            self.transport_factory,
        );

        // Anonymous rooms never record history, injected backend or not.
        let history = if self.config.room.is_identity_bearing() {
            self.history_backend
                .or_else(|| {
                    self.config
                        .history_url()
                        .map(|url| Arc::new(HttpHistoryStore::new(url)) as Arc<dyn HistoryBackend>)
                })
                .map(HistoryRecorder::new)
        } else {
            None
        };

        let (machine, inputs) = CallMachine::new(
            channel.clone(),
            self.media_source,
            self.session_factory,
            history.clone(),
            bus.clone(),
            self.config.room.self_id().cloned(),
        );

        let (channel_tx, mut channel_rx) = mpsc::channel(64);
        let channel_task = channel.spawn(channel_tx);
        let forward = inputs.clone();
        tokio::spawn(async move {
            while let Some(event) = channel_rx.recv().await {
                if forward.send(Input::Channel(event)).await.is_err() {
                    break;
                }
            }
        });
        let machine_task = tokio::spawn(machine.run());

        CallClient {
            bus,
            commands: inputs,
            history,
            channel_task,
            machine_task,
        }
    }
}

pub struct CallClient {
    bus: Arc<EventBus>,
    commands: mpsc::Sender<Input>,
    history: Option<HistoryRecorder>,
    channel_task: JoinHandle<()>,
    machine_task: JoinHandle<()>,
}

impl CallClient {
    pub async fn place_call(&self, peer: PeerId, media: MediaKind) -> Result<(), CallError> {
        self.command(|reply| Command::PlaceCall { peer, media, reply })
            .await?
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.command(|reply| Command::Accept { reply }).await?
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        self.command(|reply| Command::Decline { reply }).await?
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        self.command(|reply| Command::Hangup { reply }).await?
    }

    pub async fn roster(&self) -> Result<Vec<PeerInfo>, CallError> {
        self.command(|reply| Command::Roster { reply }).await
    }

    pub async fn current_call(&self) -> Result<Option<CallSession>, CallError> {
        self.command(|reply| Command::CurrentCall { reply }).await
    }

    /// Concluded calls, newest first. Empty in rooms that keep no
    /// history.
    pub async fn call_history(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        match &self.history {
            Some(recorder) => recorder.list().await,
            None => Ok(Vec::new()),
        }
    }

    /// Broadcast channels for observers. Subscribe before triggering the
    /// action whose events you want to see.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Ends any in-flight call politely, closes the channel and waits for
    /// both tasks to finish.
    pub async fn shutdown(self) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(Input::Command(Command::Shutdown { reply }))
            .await
            .is_ok()
        {
            let _ = done.await;
        }
        let _ = self.machine_task.await;
        let _ = self.channel_task.await;
    }

    async fn command<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Input::Command(make(reply)))
            .await
            .map_err(|_| CallError::MachineGone)?;
        response.await.map_err(|_| CallError::MachineGone)
    }
}
