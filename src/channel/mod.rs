//! Durable signaling channel to the relay.
//!
//! Owns exactly one WebSocket at a time and survives its loss: any
//! retryable disconnect schedules a redial after a fixed delay. The only
//! permanent stops are [`SignalingChannel::shutdown`] and a terminal close
//! from the relay (policy code with a "room is gone" reason).

pub mod transport;

use crate::protocol::{ClientMessage, ServerMessage};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use transport::{CloseReason, Transport, TransportEvent, TransportFactory};

/// RFC 6455 policy violation. The relay uses it for every refusal.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// What the channel reports to the call machine. Events arrive in relay
/// order; `Lost` means a redial is already scheduled, `Failed` means the
/// channel gave up for good.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected,
    Message(ServerMessage),
    Lost,
    Failed(String),
}

pub struct SignalingChannel {
    url: String,
    reconnect_delay: Duration,
    factory: Arc<dyn TransportFactory>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    connected: AtomicBool,
    stopping: AtomicBool,
    stop_notify: Notify,
}

impl SignalingChannel {
    pub fn new(
        url: impl Into<String>,
        reconnect_delay: Duration,
        factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            reconnect_delay,
            factory,
            transport: Mutex::new(None),
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    pub fn spawn(self: &Arc<Self>, events_tx: mpsc::Sender<ChannelEvent>) -> JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move { channel.run(events_tx).await })
    }

    async fn run(&self, events_tx: mpsc::Sender<ChannelEvent>) {
        while !self.stopping.load(Ordering::SeqCst) {
            match self.factory.create_transport(&self.url).await {
                Ok((transport, events)) => {
                    *self.transport.lock().await = Some(transport);
                    let terminal = self.pump(events, &events_tx).await;
                    *self.transport.lock().await = None;

                    if let Some(reason) = terminal {
                        warn!(target: "Channel", "Relay closed the room for good: {reason}");
                        let _ = events_tx.send(ChannelEvent::Failed(reason)).await;
                        return;
                    }
                }
                Err(e) => warn!(target: "Channel", "Connect failed: {e:#}"),
            }

            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            let _ = events_tx.send(ChannelEvent::Lost).await;

            debug!(target: "Channel", "Redialing in {:?}", self.reconnect_delay);
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = self.stop_notify.notified() => {}
            }
        }
        info!(target: "Channel", "Signaling channel stopped");
    }

    /// Drains one connection's events. Returns the close reason when the
    /// relay refused us permanently, `None` for every retryable end.
    async fn pump(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        events_tx: &mpsc::Sender<ChannelEvent>,
    ) -> Option<String> {
        // The flag must drop on every exit path out of this pump.
        let _flag_guard = scopeguard::guard((), |_| {
            self.connected.store(false, Ordering::SeqCst);
        });

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return None;
            }
            let event = tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => event,
                    None => return None,
                },
                _ = self.stop_notify.notified() => continue,
            };
            match event {
                TransportEvent::Connected => {
                    self.connected.store(true, Ordering::SeqCst);
                    info!(target: "Channel", "Connected to the relay");
                    let _ = events_tx.send(ChannelEvent::Connected).await;
                }
                TransportEvent::MessageReceived(text) => {
                    match ServerMessage::parse(&text) {
                        Ok(ServerMessage::Unknown) => {
                            debug!(target: "Channel", "Ignoring unknown message type")
                        }
                        Ok(message) => {
                            let _ = events_tx.send(ChannelEvent::Message(message)).await;
                        }
                        Err(e) => warn!(target: "Channel", "Dropping malformed frame: {e}"),
                    }
                }
                TransportEvent::Disconnected(reason) => {
                    return match reason {
                        Some(close) => {
                            info!(
                                target: "Channel",
                                "Connection closed by relay: {} \"{}\"", close.code, close.reason
                            );
                            is_terminal_close(&close).then_some(close.reason)
                        }
                        None => {
                            info!(target: "Channel", "Connection lost");
                            None
                        }
                    };
                }
            }
        }
    }

    /// Fire-and-forget send. When the socket is down the message is
    /// dropped with a warning; the relay protocol tolerates loss and the
    /// caller must not block on delivery.
    pub async fn send(&self, message: &ClientMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(target: "Channel", "Could not encode {}: {e}", message.kind());
                return;
            }
        };
        let guard = self.transport.lock().await;
        match guard.as_ref() {
            Some(transport) => {
                if let Err(e) = transport.send_text(&payload).await {
                    warn!(target: "Channel", "Send of {} failed: {e:#}", message.kind());
                }
            }
            None => warn!(target: "Channel", "Dropping {}: channel is not open", message.kind()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Expected disconnect: stop the run loop and close the socket without
    /// scheduling a redial.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a shutdown posted while the run
        // loop is between awaits still lands instead of waiting out a
        // full redial delay.
        self.stop_notify.notify_one();
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
    }
}

/// The relay's only unrecoverable refusals are policy closes about the
/// room itself ("Room is full", "... Room not found ..."). Everything
/// else, including an expired-room close, is worth a redial.
fn is_terminal_close(close: &CloseReason) -> bool {
    if close.code != CLOSE_POLICY_VIOLATION {
        return false;
    }
    let reason = close.reason.to_lowercase();
    reason.contains("full") || reason.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::transport::mock::MockTransportFactory;
    use super::*;
    use crate::types::PeerId;
    use tokio::time::timeout;

    const DELAY: Duration = Duration::from_millis(10);

    fn make_channel(factory: Arc<MockTransportFactory>) -> Arc<SignalingChannel> {
        SignalingChannel::new("ws://relay.test/ws/private/r1", DELAY, factory)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ChannelEvent>) -> ChannelEvent {
        timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("channel task ended unexpectedly")
    }

    #[tokio::test]
    async fn delivers_parsed_messages_and_drops_junk() {
        let factory = Arc::new(MockTransportFactory::new());
        let channel = make_channel(factory.clone());
        let (tx, mut rx) = mpsc::channel(16);
        channel.spawn(tx);

        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Connected));

        let connection = factory.last_connection().await;
        connection.push_text("this is not json").await;
        connection
            .push_text(r#"{"type": "new_hotness", "data": 1}"#)
            .await;
        connection
            .push_text(r#"{"type": "identity", "data": {"id": "u-1"}}"#)
            .await;

        // Only the well-formed known message comes through.
        match next_event(&mut rx).await {
            ChannelEvent::Message(ServerMessage::Identity { id }) => {
                assert_eq!(id, PeerId::Str("u-1".to_string()));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn terminal_close_stops_redialing() {
        let factory = Arc::new(MockTransportFactory::new());
        let channel = make_channel(factory.clone());
        let (tx, mut rx) = mpsc::channel(16);
        channel.spawn(tx);

        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Connected));
        factory.last_connection().await.close(1008, "Room is full").await;

        match next_event(&mut rx).await {
            ChannelEvent::Failed(reason) => assert_eq!(reason, "Room is full"),
            other => panic!("unexpected event: {other:?}"),
        }

        // Long enough for several redial periods.
        tokio::time::sleep(DELAY * 5).await;
        assert_eq!(factory.connection_count().await, 1);
    }

    #[tokio::test]
    async fn policy_close_without_room_reason_is_retryable() {
        let factory = Arc::new(MockTransportFactory::new());
        let channel = make_channel(factory.clone());
        let (tx, mut rx) = mpsc::channel(16);
        channel.spawn(tx);

        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Connected));
        factory
            .last_connection()
            .await
            .close(1008, "Forbidden: Invalid initData")
            .await;

        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Lost));
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Connected));
        assert!(factory.connection_count().await >= 2);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn normal_close_redials_after_fixed_delay() {
        let factory = Arc::new(MockTransportFactory::new());
        let channel = make_channel(factory.clone());
        let (tx, mut rx) = mpsc::channel(16);
        channel.spawn(tx);

        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Connected));
        factory
            .last_connection()
            .await
            .close(1000, "Room lifetime expired")
            .await;

        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Lost));
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Connected));
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn send_reaches_the_live_transport() {
        let factory = Arc::new(MockTransportFactory::new());
        let channel = make_channel(factory.clone());
        let (tx, mut rx) = mpsc::channel(16);
        channel.spawn(tx);
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Connected));

        channel
            .send(&ClientMessage::Hangup {
                target_id: PeerId::Num(7),
            })
            .await;

        let sent = factory.last_connection().await.transport.sent_messages().await;
        assert_eq!(sent, vec![r#"{"type":"hangup","data":{"target_id":7}}"#]);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn send_while_down_is_a_logged_no_op() {
        let factory = Arc::new(MockTransportFactory::new());
        let channel = make_channel(factory);
        // Never spawned: no transport exists.
        channel
            .send(&ClientMessage::Hangup {
                target_id: PeerId::Num(7),
            })
            .await;
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn shutdown_ends_the_loop_without_a_lost_event() {
        let factory = Arc::new(MockTransportFactory::new());
        let channel = make_channel(factory.clone());
        let (tx, mut rx) = mpsc::channel(16);
        channel.spawn(tx);
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Connected));

        channel.shutdown().await;

        // The sender side drops when the run loop returns; no Lost first.
        let end = timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(matches!(end, Ok(None)), "expected clean end, got {end:?}");
    }

    #[tokio::test]
    async fn shutdown_between_redials_is_not_missed() {
        let factory = Arc::new(MockTransportFactory::new());
        let channel = SignalingChannel::new(
            "ws://relay.test/ws/private/r1",
            Duration::from_secs(5),
            factory.clone(),
        );
        // Capacity 1 with Connected left unread: the Lost send below parks
        // the run loop after its stopping check but before the redial
        // select registers a waiter.
        let (tx, mut rx) = mpsc::channel(1);
        channel.spawn(tx);

        while factory.connection_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        factory.last_connection().await.close(1000, "bye").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.shutdown().await;

        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Connected));
        assert!(matches!(next_event(&mut rx).await, ChannelEvent::Lost));
        // The loop must exit well under the redial delay.
        let end = timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(matches!(end, Ok(None)), "run loop survived shutdown: {end:?}");
    }

    #[test]
    fn close_policy_matrix() {
        let terminal = |code, reason: &str| {
            is_terminal_close(&CloseReason {
                code,
                reason: reason.to_string(),
            })
        };
        assert!(terminal(1008, "Room is full"));
        assert!(terminal(1008, "Forbidden: Room not found or not private"));
        assert!(!terminal(1008, "Forbidden: Invalid initData"));
        assert!(!terminal(1000, "Room is full"));
        assert!(!terminal(1000, "Room lifetime expired"));
    }
}
