//! [`TransportLink`] – the command/telemetry socket with bounded automatic
//! recovery.
//!
//! A single supervision task owns the connection lifecycle:
//!
//! ```text
//!  connect() ──► Connecting ──open──► Connected ──close──► Disconnected
//!                    ▲                                         │
//!                    └──── sleep(base · 2^attempts) ◄──────────┤ attempts < max
//!                                                              │
//!                                                  Error ◄─────┘ attempts == max
//! ```
//!
//! Every [`TransportLink::connect`] and [`TransportLink::disconnect`] bumps a
//! generation counter, and a supervision task only changes state while its
//! own generation is current. The check happens under the state lock before
//! every attempt and again when an attempt completes, so a timer or open
//! that is already running when the link is disconnected can never install
//! a socket, even if a new `connect` follows at once. Transport faults never
//! escape this module: they become status changes and log lines.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use telelink_kernel::{CommandSchema, InboundMessage, parse_inbound};
use telelink_types::{
    ConnectionStatus, EventPayload, LinkError, LinkKind, OutboundCommand, Telemetry,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::connector::{SocketConnector, SocketSession};
use crate::hub::EventHub;

const SOURCE: &str = "telelink-middleware::transport";

/// Reconnection bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Automatic reconnects scheduled since the last successful open.
    pub attempts: u32,
    /// Set by [`TransportLink::disconnect`]; suppresses every scheduled
    /// reconnect until the next explicit [`TransportLink::connect`].
    pub manual_disconnect: bool,
}

#[derive(Default)]
struct LinkState {
    retry: RetryState,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    telemetry: Telemetry,
    supervisor: Option<JoinHandle<()>>,
    generation: u64,
}

struct Inner {
    config: TransportConfig,
    connector: Arc<dyn SocketConnector>,
    hub: EventHub,
    schema: Arc<CommandSchema>,
    status: watch::Sender<ConnectionStatus>,
    state: Mutex<LinkState>,
}

/// One command/telemetry socket.
pub struct TransportLink {
    inner: Arc<Inner>,
}

impl TransportLink {
    pub fn new(
        config: TransportConfig,
        connector: Arc<dyn SocketConnector>,
        hub: EventHub,
        schema: Arc<CommandSchema>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                hub,
                schema,
                status,
                state: Mutex::new(LinkState::default()),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn retry_state(&self) -> RetryState {
        self.inner.lock().retry
    }

    /// Last-known telemetry, merged field by field from every `status`
    /// message received so far.
    pub fn telemetry(&self) -> Telemetry {
        self.inner.lock().telemetry.clone()
    }

    /// Start the attempt sequence.
    ///
    /// Clears the manual-disconnect flag and zeroes the retry counter. A call
    /// made while a previous sequence is still running is ignored.
    pub fn connect(&self) {
        let mut state = self.inner.lock();
        if state.supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!(url = %self.inner.config.url, "connect ignored; link already active");
            return;
        }
        state.retry = RetryState::default();
        state.generation += 1;
        let generation = state.generation;
        let inner = Arc::clone(&self.inner);
        state.supervisor = Some(tokio::spawn(async move { inner.supervise(generation).await }));
    }

    /// Close the socket and cancel every pending reconnect.
    pub fn disconnect(&self) {
        let supervisor = {
            let mut state = self.inner.lock();
            state.retry.manual_disconnect = true;
            state.generation += 1;
            state.outgoing = None;
            self.inner.set_status(ConnectionStatus::Disconnected);
            state.supervisor.take()
        };
        if let Some(handle) = supervisor {
            handle.abort();
        }
        info!(url = %self.inner.config.url, "socket disconnected by request");
    }

    /// Validate `cmd` and write it to the socket.
    ///
    /// Nothing is queued: with no open socket the command is dropped and
    /// [`LinkError::NotConnected`] returned. Invalid commands are never
    /// transmitted.
    pub fn send(&self, cmd: &OutboundCommand) -> Result<(), LinkError> {
        let serialized = self.inner.schema.validate(cmd).map_err(|e| {
            warn!(kind = cmd.type_tag(), error = %e, "dropping invalid command");
            LinkError::from(e)
        })?;

        let state = self.inner.lock();
        let Some(outgoing) = state.outgoing.as_ref() else {
            debug!(kind = cmd.type_tag(), "socket not open; command dropped");
            return Err(LinkError::NotConnected);
        };
        outgoing.send(serialized.text).map_err(|_| {
            debug!(kind = cmd.type_tag(), "socket closing; command dropped");
            LinkError::NotConnected
        })
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.lock().supervisor.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("url", &self.inner.config.url)
            .field("status", &self.status())
            .field("retry", &self.retry_state())
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set `status` on behalf of supervisor `generation`. False once that
    /// supervisor has been superseded.
    fn settle(&self, generation: u64, status: ConnectionStatus) -> bool {
        let state = self.lock();
        if state.generation != generation {
            return false;
        }
        self.set_status(status);
        true
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            self.hub.emit(
                SOURCE,
                EventPayload::Status {
                    link: LinkKind::Transport,
                    status,
                },
            );
        }
    }

    async fn supervise(self: Arc<Self>, generation: u64) {
        let policy = self.config.retry;
        loop {
            if !self.settle(generation, ConnectionStatus::Connecting) {
                return;
            }

            let opened =
                tokio::time::timeout(self.config.connect_timeout, self.connector.open(&self.config.url))
                    .await;
            match opened {
                Ok(Ok(session)) => self.run_session(session, generation).await,
                Ok(Err(e)) => warn!(url = %self.config.url, error = %e, "socket open failed"),
                Err(_) => warn!(
                    url = %self.config.url,
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "socket open timed out"
                ),
            }

            let scheduled = {
                let mut state = self.lock();
                if state.generation != generation || state.retry.manual_disconnect {
                    return;
                }
                state.outgoing = None;
                let attempt = state.retry.attempts;
                if attempt < policy.max_retries {
                    state.retry.attempts += 1;
                    Some(attempt)
                } else {
                    None
                }
            };

            let Some(attempt) = scheduled else {
                if !self.settle(generation, ConnectionStatus::Error) {
                    return;
                }
                error!(
                    url = %self.config.url,
                    attempts = policy.max_retries,
                    "giving up on socket; call connect() to try again"
                );
                return;
            };

            if !self.settle(generation, ConnectionStatus::Disconnected) {
                return;
            }
            let delay = policy.delay_for(attempt);
            info!(
                url = %self.config.url,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_session(&self, session: SocketSession, generation: u64) {
        let SocketSession {
            outgoing,
            mut incoming,
        } = session;
        {
            let mut state = self.lock();
            if state.generation != generation || state.retry.manual_disconnect {
                debug!(url = %self.config.url, "socket opened for a cancelled attempt; closing");
                return;
            }
            state.retry.attempts = 0;
            state.outgoing = Some(outgoing);
            self.set_status(ConnectionStatus::Connected);
        }
        info!(url = %self.config.url, "socket connected");

        while let Some(frame) = incoming.next().await {
            if self.lock().generation != generation {
                break;
            }
            match frame {
                Ok(text) => self.handle_inbound(&text),
                Err(e) => {
                    warn!(url = %self.config.url, error = %e, "socket transport error");
                    break;
                }
            }
        }
        info!(url = %self.config.url, "socket closed");
    }

    fn handle_inbound(&self, text: &str) {
        match parse_inbound(text) {
            Ok(InboundMessage::Status(update)) => {
                let snapshot = {
                    let mut state = self.lock();
                    state.telemetry.merge(&update);
                    state.telemetry.clone()
                };
                self.hub.emit(SOURCE, EventPayload::Telemetry(snapshot));
            }
            Ok(InboundMessage::Chat(payload)) => {
                self.hub.emit(SOURCE, EventPayload::Chat(payload));
            }
            Err(e) => warn!(error = %e, "discarding inbound frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::stream;
    use tokio::time::Instant;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::connector::WebSocketConnector;
    use crate::hub::Topic;

    /// Hands out pre-built sessions in order, then refuses.
    #[derive(Default)]
    struct ScriptedConnector {
        opens: Mutex<Vec<Instant>>,
        sessions: Mutex<VecDeque<SocketSession>>,
    }

    impl ScriptedConnector {
        fn with_sessions(sessions: Vec<SocketSession>) -> Self {
            Self {
                opens: Mutex::default(),
                sessions: Mutex::new(sessions.into()),
            }
        }

        fn opens(&self) -> Vec<Instant> {
            self.opens.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SocketConnector for ScriptedConnector {
        async fn open(&self, _url: &str) -> Result<SocketSession, LinkError> {
            self.opens.lock().unwrap().push(Instant::now());
            self.sessions
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LinkError::Connection("refused".into()))
        }
    }

    /// A session whose peer side is the returned channels.
    fn session() -> (
        SocketSession,
        mpsc::UnboundedSender<Result<String, LinkError>>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (outgoing, written) = mpsc::unbounded_channel();
        let (inbound, rx) = mpsc::unbounded_channel();
        let incoming = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) })
            .boxed();
        (SocketSession { outgoing, incoming }, inbound, written)
    }

    fn link(connector: Arc<ScriptedConnector>, hub: &EventHub) -> TransportLink {
        TransportLink::new(
            TransportConfig::default(),
            connector,
            hub.clone(),
            Arc::new(CommandSchema::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_stops_after_five_retries() -> Result<(), Box<dyn std::error::Error>>
    {
        let connector = Arc::new(ScriptedConnector::default());
        let hub = EventHub::default();
        let link = link(Arc::clone(&connector), &hub);
        let mut status = link.watch_status();

        link.connect();
        status.wait_for(|s| *s == ConnectionStatus::Error).await?;

        let opens = connector.opens();
        assert_eq!(opens.len(), 6, "initial attempt plus five retries");
        let gaps: Vec<u64> = opens.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![2, 4, 8, 16, 32]);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.opens().len(), 6, "no sixth automatic retry");
        assert_eq!(link.status(), ConnectionStatus::Error);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_connect_after_exhaustion_starts_over() -> Result<(), Box<dyn std::error::Error>>
    {
        let connector = Arc::new(ScriptedConnector::default());
        let hub = EventHub::default();
        let link = TransportLink::new(
            TransportConfig {
                retry: RetryPolicy {
                    max_retries: 1,
                    base_delay: Duration::from_secs(1),
                },
                ..TransportConfig::default()
            },
            Arc::clone(&connector) as Arc<dyn SocketConnector>,
            hub,
            Arc::new(CommandSchema::new()),
        );
        let mut status = link.watch_status();

        link.connect();
        status.wait_for(|s| *s == ConnectionStatus::Error).await?;
        assert_eq!(connector.opens().len(), 2);

        link.connect();
        status.wait_for(|s| *s != ConnectionStatus::Error).await?;
        assert_eq!(link.retry_state().attempts, 1);
        status.wait_for(|s| *s == ConnectionStatus::Error).await?;
        assert_eq!(connector.opens().len(), 4);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let connector = Arc::new(ScriptedConnector::default());
        let hub = EventHub::default();
        let link = link(Arc::clone(&connector), &hub);

        link.connect();
        // First attempt fails at t=0; the 2 s reconnect is now pending.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.opens().len(), 1);

        link.disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(connector.opens().len(), 1);
        assert_eq!(link.status(), ConnectionStatus::Disconnected);
        assert!(link.retry_state().manual_disconnect);
    }

    #[tokio::test]
    async fn superseded_attempt_cannot_install_its_socket() -> Result<(), Box<dyn std::error::Error>>
    {
        let (current, _peer, mut written) = session();
        let (late, _late_peer, mut late_written) = session();
        let connector = Arc::new(ScriptedConnector::with_sessions(vec![current]));
        let link = link(Arc::clone(&connector), &EventHub::default());
        let mut status = link.watch_status();

        link.connect();
        let superseded = link.inner.lock().generation;
        link.disconnect();
        link.connect();
        status.wait_for(|s| *s == ConnectionStatus::Connected).await?;

        // The first supervisor finishing its open after the reconnect.
        link.inner.run_session(late, superseded).await;
        Arc::clone(&link.inner).supervise(superseded).await;

        assert_eq!(link.status(), ConnectionStatus::Connected);
        assert_eq!(connector.opens().len(), 1);
        link.send(&OutboundCommand::EmergencyStop)?;
        assert!(written.recv().await.is_some());
        assert!(late_written.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_close_resets_attempts() -> Result<(), Box<dyn std::error::Error>> {
        let (first, first_peer, _w1) = session();
        let (second, _second_peer, _w2) = session();
        let connector = Arc::new(ScriptedConnector::with_sessions(vec![first, second]));
        let hub = EventHub::default();
        let link = link(Arc::clone(&connector), &hub);
        let mut status = link.watch_status();

        link.connect();
        status.wait_for(|s| *s == ConnectionStatus::Connected).await?;

        drop(first_peer);
        status.wait_for(|s| *s == ConnectionStatus::Disconnected).await?;
        assert_eq!(link.retry_state().attempts, 1);

        status.wait_for(|s| *s == ConnectionStatus::Connected).await?;
        let opens = connector.opens();
        assert_eq!(opens.len(), 2);
        assert_eq!((opens[1] - opens[0]).as_secs(), 2);
        assert_eq!(link.retry_state().attempts, 0);
        Ok(())
    }

    #[tokio::test]
    async fn send_without_socket_is_dropped() {
        let connector = Arc::new(ScriptedConnector::default());
        let link = link(connector, &EventHub::default());
        let result = link.send(&OutboundCommand::EmergencyStop);
        assert!(matches!(result, Err(LinkError::NotConnected)));
    }

    #[tokio::test]
    async fn send_validates_then_writes() -> Result<(), Box<dyn std::error::Error>> {
        let (s, _peer, mut written) = session();
        let connector = Arc::new(ScriptedConnector::with_sessions(vec![s]));
        let link = link(connector, &EventHub::default());
        let mut status = link.watch_status();
        link.connect();
        status.wait_for(|s| *s == ConnectionStatus::Connected).await?;

        let invalid = OutboundCommand::Move {
            angle: 90.0,
            speed: 150.0,
            rotation: 0.0,
        };
        assert!(matches!(link.send(&invalid), Err(LinkError::Validation(_))));

        link.send(&OutboundCommand::Move {
            angle: 90.0,
            speed: 100.0,
            rotation: 0.0,
        })?;
        let frame: serde_json::Value = serde_json::from_str(&written.recv().await.expect("frame"))?;
        assert_eq!(frame["type"], "move");
        assert_eq!(frame["data"]["speed"], 100.0);
        assert!(frame["timestamp"].is_i64());
        assert!(written.try_recv().is_err(), "invalid command must not be written");
        Ok(())
    }

    #[tokio::test]
    async fn status_messages_merge_into_telemetry() -> Result<(), Box<dyn std::error::Error>> {
        let (s, peer, _written) = session();
        let connector = Arc::new(ScriptedConnector::with_sessions(vec![s]));
        let hub = EventHub::default();
        let mut telemetry = hub.subscribe_to(Topic::Telemetry);
        let mut chat = hub.subscribe_to(Topic::Chat);
        let link = link(connector, &hub);
        link.connect();

        peer.send(Ok(r#"{"type":"status","data":{"battery":42}}"#.into()))?;
        peer.send(Ok("not json".into()))?;
        peer.send(Ok(r#"{"type":"status","data":{"temperature":50}}"#.into()))?;
        peer.send(Ok(r#"{"type":"chat","data":{"text":"hi"}}"#.into()))?;

        let first = telemetry.recv().await?;
        let second = telemetry.recv().await?;
        let EventPayload::Telemetry(first) = first.payload else {
            panic!("expected telemetry")
        };
        let EventPayload::Telemetry(second) = second.payload else {
            panic!("expected telemetry")
        };
        assert_eq!(first.battery, Some(42.0));
        assert_eq!(first.temperature, None);
        assert_eq!(second.battery, Some(42.0));
        assert_eq!(second.temperature, Some(50.0));
        assert_eq!(second.wifi_strength, None);
        assert_eq!(link.telemetry(), second);

        let EventPayload::Chat(payload) = chat.recv().await?.payload else {
            panic!("expected chat")
        };
        assert_eq!(payload["text"], "hi");
        Ok(())
    }

    #[tokio::test]
    async fn round_trip_over_a_real_socket() -> Result<(), Box<dyn std::error::Error>> {
        use futures_util::SinkExt;
        use tokio::net::TcpListener;
        use tokio_tungstenite::tungstenite::Message;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
            ws.send(Message::Text(r#"{"type":"status","data":{"battery":77}}"#.into()))
                .await
                .expect("send");
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(t))) => break t.as_str().to_owned(),
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        });

        let hub = EventHub::default();
        let mut telemetry = hub.subscribe_to(Topic::Telemetry);
        let link = TransportLink::new(
            TransportConfig {
                url: format!("ws://{addr}"),
                ..TransportConfig::default()
            },
            Arc::new(WebSocketConnector::default()),
            hub,
            Arc::new(CommandSchema::new()),
        );
        let mut status = link.watch_status();
        link.connect();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == ConnectionStatus::Connected),
        )
        .await??;

        let event = tokio::time::timeout(Duration::from_secs(5), telemetry.recv()).await??;
        assert!(matches!(event.payload, EventPayload::Telemetry(t) if t.battery == Some(77.0)));

        link.send(&OutboundCommand::EmergencyStop)?;
        let received = tokio::time::timeout(Duration::from_secs(5), server).await??;
        let frame: serde_json::Value = serde_json::from_str(&received)?;
        assert_eq!(frame["type"], "emergency_stop");
        assert_eq!(frame["data"], serde_json::json!({}));

        link.disconnect();
        assert_eq!(link.status(), ConnectionStatus::Disconnected);
        Ok(())
    }
}
