//! [`MessageBusLink`] – fire-and-forget robot commands and wide-net listening
//! over MQTT.
//!
//! The link never reconnects on its own. A lost connection turns the status
//! to `Error` and stops the poll task; whoever owns the link decides whether
//! to call [`MessageBusLink::connect`] again.
//!
//! Everything is published and subscribed at QoS 0.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use telelink_types::{ConnectionStatus, EventPayload, LinkError, LinkKind, ValidationError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BusConfig;
use crate::hub::EventHub;

const SOURCE: &str = "telelink-middleware::bus";

const DEFAULT_PORT: u16 = 1883;

/// Requests buffered between the client handle and the poll task.
const REQUEST_CAPACITY: usize = 64;

/// Body of a bus publish.
#[derive(Debug, Clone, PartialEq)]
pub enum BusPayload {
    /// Serialized as JSON.
    Json(Value),
    /// Sent as-is.
    Text(String),
}

impl BusPayload {
    fn into_bytes(self) -> Result<Vec<u8>, LinkError> {
        match self {
            BusPayload::Json(value) => {
                serde_json::to_vec(&value).map_err(|e| LinkError::Serialization(e.to_string()))
            }
            BusPayload::Text(text) => Ok(text.into_bytes()),
        }
    }
}

/// Payload of `<namespace>/<serial>/<category>` command topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusCommand {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Default)]
struct BusState {
    client: Option<AsyncClient>,
    pump: Option<JoinHandle<()>>,
    /// Broker of the current (or in-flight) session.
    url: Option<String>,
    /// Bumped by every connect and disconnect. A connect attempt or poll
    /// task only touches state while its generation is still current.
    generation: u64,
}

fn cancelled() -> LinkError {
    LinkError::Connection("bus connect cancelled".into())
}

struct Inner {
    config: BusConfig,
    hub: EventHub,
    status: watch::Sender<ConnectionStatus>,
    state: Mutex<BusState>,
}

pub struct MessageBusLink {
    inner: Arc<Inner>,
}

impl MessageBusLink {
    pub fn new(config: BusConfig, hub: EventHub) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                hub,
                status,
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Broker of the current or in-flight session, if any.
    pub fn url(&self) -> Option<String> {
        self.inner.lock().url.clone()
    }

    /// Connect to the broker at `url` and subscribe to `topics`.
    ///
    /// Waits for the broker's CONNACK for at most the configured connect
    /// timeout. On timeout the half-open attempt is dropped, the status
    /// becomes `Error` and [`LinkError::Timeout`] is returned.
    ///
    /// A link already connected or connecting to `url` returns `Ok` without
    /// a new attempt. A session with a different broker is dropped first.
    /// A [`disconnect`](Self::disconnect) while the CONNACK is outstanding
    /// cancels the attempt: the status is left alone and an error returned.
    pub async fn connect(&self, url: &str, topics: &[String]) -> Result<(), LinkError> {
        let inner = &self.inner;
        let generation = {
            let mut state = inner.lock();
            let active = matches!(
                self.status(),
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            );
            if active && state.url.as_deref() == Some(url) {
                debug!(url, "bus connect ignored; already active");
                return Ok(());
            }
            if active {
                info!(from = state.url.as_deref(), to = url, "switching bus broker");
                if let Some(pump) = state.pump.take() {
                    pump.abort();
                }
                state.client = None;
            }
            state.generation += 1;
            state.url = Some(url.to_string());
            state.generation
        };

        let options = match inner.mqtt_options(url) {
            Ok(options) => options,
            Err(e) => {
                warn!(url, error = %e, "bus connect rejected");
                return Err(inner.fail(generation, e));
            }
        };

        if !inner.settle(generation, ConnectionStatus::Connecting) {
            return Err(cancelled());
        }
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let timeout = inner.config.connect_timeout;
        let acked = tokio::time::timeout(timeout, wait_for_connack(&mut eventloop)).await;
        match acked {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(url, error = %e, "bus connect failed");
                return Err(inner.fail(generation, e));
            }
            Err(_) => {
                let ms = timeout.as_millis() as u64;
                warn!(url, timeout_ms = ms, "bus connect timed out");
                return Err(inner.fail(generation, LinkError::Timeout(ms)));
            }
        }

        {
            // The pump clears this state when the connection drops, so it
            // must not start before the state is in place.
            let mut state = inner.lock();
            if state.generation != generation {
                info!(url, "bus connect cancelled before CONNACK");
                return Err(cancelled());
            }
            for topic in topics {
                if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                    warn!(topic = %topic, error = %e, "bus subscribe failed");
                }
            }
            state.client = Some(client);
            inner.set_status(ConnectionStatus::Connected);
            let pump = tokio::spawn(Arc::clone(inner).pump(eventloop, generation));
            if let Some(stale) = state.pump.replace(pump) {
                stale.abort();
            }
        }
        info!(url, topics = topics.len(), "bus connected");
        Ok(())
    }

    /// Publish `payload` on `topic` at QoS 0.
    ///
    /// Not connected: logged and [`LinkError::NotConnected`] returned. A
    /// failed publish is logged and returned, never retried.
    pub fn publish(&self, topic: &str, payload: BusPayload) -> Result<(), LinkError> {
        let client = {
            let state = self.inner.lock();
            match (&state.client, self.status()) {
                (Some(client), ConnectionStatus::Connected) => client.clone(),
                _ => {
                    warn!(topic, "bus not connected; publish dropped");
                    return Err(LinkError::NotConnected);
                }
            }
        };
        let bytes = payload.into_bytes()?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, bytes)
            .map_err(|e| {
                warn!(topic, error = %e, "bus publish failed");
                LinkError::Transport(e.to_string())
            })
    }

    /// Publish `{cmd, params?, timestamp}` on
    /// `<namespace>/<serial>/<category>`.
    pub fn publish_command(
        &self,
        category: &str,
        cmd: &str,
        params: Option<Value>,
    ) -> Result<(), LinkError> {
        if category.is_empty() {
            return Err(ValidationError::Empty {
                field: "category".into(),
            }
            .into());
        }
        if category.contains(['/', '+', '#']) {
            return Err(ValidationError::Malformed(format!(
                "command category '{category}' must be a single topic level"
            ))
            .into());
        }
        if cmd.trim().is_empty() {
            return Err(ValidationError::Empty { field: "cmd".into() }.into());
        }

        let command = BusCommand {
            cmd: cmd.trim().to_string(),
            params,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let body =
            serde_json::to_value(&command).map_err(|e| LinkError::Serialization(e.to_string()))?;
        self.publish(&self.inner.config.command_topic(category), BusPayload::Json(body))
    }

    /// Drop the connection at once; unacknowledged requests are discarded.
    pub fn disconnect(&self) {
        let (client, pump) = {
            let mut state = self.inner.lock();
            state.generation += 1;
            state.url = None;
            self.inner.set_status(ConnectionStatus::Disconnected);
            (state.client.take(), state.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        drop(client);
        info!("bus disconnected by request");
    }
}

impl Drop for MessageBusLink {
    fn drop(&mut self) {
        if let Some(pump) = self.inner.lock().pump.take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for MessageBusLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBusLink")
            .field("url", &self.url())
            .field("status", &self.status())
            .finish()
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), LinkError> {
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(LinkError::Connection(e.to_string())),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set `status` if `generation` is still the current attempt.
    fn settle(&self, generation: u64, status: ConnectionStatus) -> bool {
        let state = self.lock();
        if state.generation != generation {
            return false;
        }
        self.set_status(status);
        true
    }

    /// Record a failed attempt. A superseded attempt leaves the status to
    /// whoever superseded it.
    fn fail(&self, generation: u64, error: LinkError) -> LinkError {
        if self.settle(generation, ConnectionStatus::Error) {
            error
        } else {
            cancelled()
        }
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
                    link: LinkKind::Bus,
                    status,
                },
            );
        }
    }

    /// `mqtt://[user[:password]@]host[:port]` → [`MqttOptions`].
    ///
    /// Without a password in the URL the configured auth token is sent as
    /// the password.
    fn mqtt_options(&self, url: &str) -> Result<MqttOptions, LinkError> {
        let parsed =
            Url::parse(url).map_err(|e| LinkError::Connection(format!("invalid bus url {url}: {e}")))?;
        match parsed.scheme() {
            "mqtt" | "tcp" => {}
            other => {
                return Err(LinkError::Connection(format!(
                    "unsupported bus scheme '{other}'"
                )));
            }
        }
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| LinkError::Connection(format!("bus url {url} has no host")))?;
        let port = parsed.port().unwrap_or(DEFAULT_PORT);

        let mut options = MqttOptions::new(self.config.client_id.as_str(), host, port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);

        let password = parsed
            .password()
            .map(str::to_owned)
            .or_else(|| self.config.auth_token.clone());
        if !parsed.username().is_empty() || password.is_some() {
            options.set_credentials(parsed.username(), password.unwrap_or_default());
        }
        Ok(options)
    }

    /// Forward inbound publishes to observers until the connection drops.
    async fn pump(self: Arc<Self>, mut eventloop: EventLoop, generation: u64) {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                    self.hub.emit(
                        SOURCE,
                        EventPayload::BusMessage {
                            topic: publish.topic,
                            payload,
                        },
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "bus connection lost");
                    let mut state = self.lock();
                    if state.generation == generation {
                        state.client = None;
                        state.pump = None;
                        self.set_status(ConnectionStatus::Error);
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::hub::Topic;

    fn config() -> BusConfig {
        BusConfig {
            client_id: "telelink-test".into(),
            serial: "123".into(),
            namespace: "temi".into(),
            ..BusConfig::default()
        }
    }

    /// QoS 0 PUBLISH packet, short enough for a one-byte remaining length.
    fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
        let remaining = 2 + topic.len() + payload.len();
        assert!(remaining < 128);
        let mut frame = vec![0x30, remaining as u8, 0x00, topic.len() as u8];
        frame.extend_from_slice(topic.as_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn publish_without_connection_is_refused() {
        let link = MessageBusLink::new(config(), EventHub::default());
        let result = link.publish("robot/x", BusPayload::Text("hi".into()));
        assert!(matches!(result, Err(LinkError::NotConnected)));
    }

    #[test]
    fn command_category_must_be_one_level() {
        let link = MessageBusLink::new(config(), EventHub::default());
        assert!(matches!(
            link.publish_command("move/left", "go", None),
            Err(LinkError::Validation(ValidationError::Malformed(_)))
        ));
        assert!(matches!(
            link.publish_command("#", "go", None),
            Err(LinkError::Validation(_))
        ));
        assert!(matches!(
            link.publish_command("move", "  ", None),
            Err(LinkError::Validation(ValidationError::Empty { .. }))
        ));
    }

    #[test]
    fn options_come_from_url() -> Result<(), Box<dyn std::error::Error>> {
        let link = MessageBusLink::new(config(), EventHub::default());
        let options = link.inner.mqtt_options("mqtt://user:pw@broker.local:1884")?;
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));

        let options = link.inner.mqtt_options("tcp://broker.local")?;
        assert_eq!(options.broker_address().1, DEFAULT_PORT);

        assert!(link.inner.mqtt_options("http://broker.local").is_err());
        assert!(link.inner.mqtt_options("not a url").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn bad_scheme_sets_error_status() {
        let link = MessageBusLink::new(config(), EventHub::default());
        let result = link.connect("ws://localhost:1883", &[]).await;
        assert!(matches!(result, Err(LinkError::Connection(_))));
        assert_eq!(link.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn silent_broker_times_out() -> Result<(), Box<dyn std::error::Error>> {
        // Accepts TCP but never answers CONNECT.
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let link = MessageBusLink::new(
            BusConfig {
                connect_timeout: Duration::from_millis(300),
                ..config()
            },
            EventHub::default(),
        );

        let result = link.connect(&format!("mqtt://{addr}"), &[]).await;
        assert!(matches!(result, Err(LinkError::Timeout(300))));
        assert_eq!(link.status(), ConnectionStatus::Error);
        drop(listener);
        Ok(())
    }

    #[tokio::test]
    async fn refused_connection_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
        let link = MessageBusLink::new(config(), EventHub::default());
        let result = link.connect(&format!("mqtt://{addr}"), &[]).await;
        assert!(result.is_err_and(|e| e.is_connection_failure()));
        assert_eq!(link.status(), ConnectionStatus::Error);
        Ok(())
    }

    /// Broker that answers one CONNECT once `release` fires.
    async fn held_broker(
        release: tokio::sync::oneshot::Receiver<()>,
    ) -> std::io::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            let mut buf = vec![0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let _ = release.await;
            let _ = sock.write_all(&[0x20, 0x02, 0x00, 0x00]).await;
            // Keep the socket open until the test is done with it.
            let _ = sock.read(&mut buf).await;
        });
        Ok((addr, task))
    }

    #[tokio::test]
    async fn disconnect_while_awaiting_connack_wins() -> Result<(), Box<dyn std::error::Error>> {
        let (release, held) = tokio::sync::oneshot::channel();
        let (addr, broker) = held_broker(held).await?;
        let link = Arc::new(MessageBusLink::new(config(), EventHub::default()));
        let mut status = link.watch_status();

        let connecting = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.connect(&format!("mqtt://{addr}"), &[]).await })
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == ConnectionStatus::Connecting),
        )
        .await??;

        link.disconnect();
        let _ = release.send(());

        let result = tokio::time::timeout(Duration::from_secs(5), connecting).await??;
        assert!(matches!(result, Err(LinkError::Connection(_))));
        assert_eq!(link.status(), ConnectionStatus::Disconnected);
        assert_eq!(link.url(), None);
        assert!(matches!(
            link.publish("robot/x", BusPayload::Text("hi".into())),
            Err(LinkError::NotConnected)
        ));
        broker.abort();
        Ok(())
    }

    #[tokio::test]
    async fn connecting_elsewhere_switches_broker() -> Result<(), Box<dyn std::error::Error>> {
        let (release_a, held_a) = tokio::sync::oneshot::channel();
        let (release_b, held_b) = tokio::sync::oneshot::channel();
        let _ = release_a.send(());
        let _ = release_b.send(());
        let (a, broker_a) = held_broker(held_a).await?;
        let (b, broker_b) = held_broker(held_b).await?;
        let link = MessageBusLink::new(config(), EventHub::default());

        link.connect(&format!("mqtt://{a}"), &[]).await?;
        assert_eq!(link.url(), Some(format!("mqtt://{a}")));

        link.connect(&format!("mqtt://{b}"), &[]).await?;
        assert_eq!(link.status(), ConnectionStatus::Connected);
        assert_eq!(link.url(), Some(format!("mqtt://{b}")));
        // A's session is gone: its broker task sees the socket close.
        tokio::time::timeout(Duration::from_secs(5), broker_a).await??;

        link.disconnect();
        broker_b.abort();
        Ok(())
    }

    #[tokio::test]
    async fn forwards_traffic_and_publishes_commands() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let broker = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.expect("read CONNECT");
            assert!(n > 0 && buf[0] == 0x10, "expected CONNECT");
            sock.write_all(&[0x20, 0x02, 0x00, 0x00]).await.expect("CONNACK");
            sock.write_all(&publish_frame("robot/123/status", br#"{"battery":50}"#))
                .await
                .expect("PUBLISH");

            let mut seen = buf[..n].to_vec();
            while !(contains(&seen, b"temi/123/move") && contains(&seen, br#""cmd":"forward""#)) {
                let n = sock.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            // Hand the socket back so the connection outlives this task.
            (seen, sock)
        });

        let hub = EventHub::default();
        let mut traffic = hub.subscribe_to(Topic::BusTraffic);
        let mut all = hub.subscribe();
        let link = MessageBusLink::new(config(), hub);

        link.connect(&format!("mqtt://{addr}"), &BusConfig::default_topics("temi"))
            .await?;
        assert_eq!(link.status(), ConnectionStatus::Connected);
        // Reconnecting an active link is a no-op.
        link.connect(&format!("mqtt://{addr}"), &[]).await?;

        let event = tokio::time::timeout(Duration::from_secs(5), traffic.recv()).await??;
        match event.payload {
            EventPayload::BusMessage { topic, payload } => {
                assert_eq!(topic, "robot/123/status");
                assert_eq!(payload, r#"{"battery":50}"#);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        link.publish_command("move", "forward", Some(serde_json::json!({ "speed": 10 })))?;
        let (seen, _sock) = tokio::time::timeout(Duration::from_secs(5), broker).await??;
        assert!(contains(&seen, b"temi/#"), "default subscriptions sent");
        assert!(contains(&seen, b"temi/123/move"));
        assert!(contains(&seen, br#""params":{"speed":10}"#));

        link.disconnect();
        assert_eq!(link.status(), ConnectionStatus::Disconnected);

        let mut transitions = Vec::new();
        while let Ok(event) = all.try_recv() {
            if let EventPayload::Status { status, .. } = event.payload {
                transitions.push(status);
            }
        }
        assert_eq!(
            transitions,
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected
            ]
        );
        Ok(())
    }
}
