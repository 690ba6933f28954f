//! [`ConnectionRegistry`] – the one place that owns the process's links.
//!
//! The composition root builds a single registry and hands `Arc`s of it to
//! whoever needs to talk to the robot. The registry holds at most one
//! [`TransportLink`] and one [`MessageBusLink`], creates them on explicit
//! connect calls, and forgets them on explicit disconnect so the next
//! connect starts with a zeroed retry counter.
//!
//! The operating mode lives here too: every change goes through
//! [`ConnectionRegistry::dispatch`] and is announced on [`Topic::Mode`].
//!
//! Observers subscribe to the [`EventHub`], never to a link, so replacing a
//! link does not require anyone to resubscribe.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use telelink_kernel::{CommandSchema, OperatingStateMachine, Transition};
use telelink_types::{
    ConnectionStatus, EventPayload, LinkError, ModeEvent, OperatingMode, OutboundCommand,
    Telemetry, TransitionRejected,
};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{LinkConfig, TransportConfig};
use crate::connector::{SocketConnector, WebSocketConnector};
use crate::hub::{EventHub, Topic, TopicReceiver};
use crate::message_bus_link::{BusPayload, MessageBusLink};
use crate::transport_link::{RetryState, TransportLink};

const SOURCE: &str = "telelink-middleware::registry";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ConnectionRegistry {
    config: LinkConfig,
    hub: EventHub,
    schema: Arc<CommandSchema>,
    connector: Arc<dyn SocketConnector>,
    transport: Mutex<Option<TransportLink>>,
    bus: Mutex<Option<Arc<MessageBusLink>>>,
    mode: Mutex<OperatingStateMachine>,
    mode_tx: watch::Sender<OperatingMode>,
}

impl ConnectionRegistry {
    /// Registry using real WebSockets for the command socket.
    pub fn new(config: LinkConfig, hub: EventHub) -> Self {
        let connector = Arc::new(WebSocketConnector::new(config.transport.auth_token.clone()));
        Self::with_connector(config, hub, connector)
    }

    pub fn with_connector(
        config: LinkConfig,
        hub: EventHub,
        connector: Arc<dyn SocketConnector>,
    ) -> Self {
        let (mode_tx, _) = watch::channel(OperatingMode::Idle);
        Self {
            config,
            hub,
            schema: Arc::new(CommandSchema::new()),
            connector,
            transport: Mutex::new(None),
            bus: Mutex::new(None),
            mode: Mutex::new(OperatingStateMachine::new()),
            mode_tx,
        }
    }

    /// Replace the command schema used by links created from now on.
    pub fn with_schema(mut self, schema: CommandSchema) -> Self {
        self.schema = Arc::new(schema);
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn subscribe(&self, topic: Topic) -> TopicReceiver {
        self.hub.subscribe_to(topic)
    }

    // ── Command socket ──────────────────────────────────────────────────────

    /// Connect the command socket to `url`.
    ///
    /// Already connected (or connecting, or waiting out a backoff) to the
    /// same `url`: logged and left alone. A link to a different URL is torn
    /// down and replaced.
    pub fn connect_transport(&self, url: &str) {
        let mut slot = lock(&self.transport);
        if let Some(link) = slot.as_ref() {
            if link.url() == url {
                if link.status() == ConnectionStatus::Connected {
                    info!(url, "socket already connected");
                } else {
                    link.connect();
                }
                return;
            }
            info!(from = link.url(), to = url, "replacing socket link");
            link.disconnect();
        }

        let link = TransportLink::new(
            TransportConfig {
                url: url.to_string(),
                ..self.config.transport.clone()
            },
            Arc::clone(&self.connector),
            self.hub.clone(),
            Arc::clone(&self.schema),
        );
        link.connect();
        *slot = Some(link);
    }

    /// Tear down the command socket and forget it.
    pub fn disconnect_transport(&self) {
        match lock(&self.transport).take() {
            Some(link) => link.disconnect(),
            None => debug!("no socket link to disconnect"),
        }
    }

    /// Validate and send `cmd` over the command socket.
    pub fn send(&self, cmd: &OutboundCommand) -> Result<(), LinkError> {
        match lock(&self.transport).as_ref() {
            Some(link) => link.send(cmd),
            None => {
                debug!(kind = cmd.type_tag(), "no socket link; command dropped");
                Err(LinkError::NotConnected)
            }
        }
    }

    pub fn transport_status(&self) -> ConnectionStatus {
        lock(&self.transport)
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, TransportLink::status)
    }

    pub fn transport_retry(&self) -> Option<RetryState> {
        lock(&self.transport).as_ref().map(TransportLink::retry_state)
    }

    /// Last-known telemetry of the current socket link.
    pub fn telemetry(&self) -> Telemetry {
        lock(&self.transport)
            .as_ref()
            .map(TransportLink::telemetry)
            .unwrap_or_default()
    }

    // ── Message bus ─────────────────────────────────────────────────────────

    /// Connect the bus to `url` with the configured subscriptions. Never
    /// retried automatically.
    ///
    /// Already connected or connecting to the same `url`: logged and left
    /// alone. A link to a different broker is torn down and replaced.
    pub async fn connect_bus(&self, url: &str) -> Result<(), LinkError> {
        let link = {
            let mut slot = lock(&self.bus);
            if let Some(link) = slot.as_ref() {
                let active = matches!(
                    link.status(),
                    ConnectionStatus::Connected | ConnectionStatus::Connecting
                );
                let current = link.url();
                if current.as_deref() == Some(url) && active {
                    info!(url, "bus already connected");
                    return Ok(());
                }
                if let Some(from) = current.as_deref().filter(|from| *from != url) {
                    info!(from, to = url, "replacing bus link");
                }
                link.disconnect();
            }
            let link = Arc::new(MessageBusLink::new(self.config.bus.clone(), self.hub.clone()));
            *slot = Some(Arc::clone(&link));
            link
        };
        link.connect(url, &self.config.bus.topics).await
    }

    pub fn disconnect_bus(&self) {
        match lock(&self.bus).take() {
            Some(link) => link.disconnect(),
            None => debug!("no bus link to disconnect"),
        }
    }

    pub fn publish(&self, topic: &str, payload: BusPayload) -> Result<(), LinkError> {
        self.bus_link()?.publish(topic, payload)
    }

    pub fn publish_command(
        &self,
        category: &str,
        cmd: &str,
        params: Option<Value>,
    ) -> Result<(), LinkError> {
        self.bus_link()?.publish_command(category, cmd, params)
    }

    pub fn bus_status(&self) -> ConnectionStatus {
        lock(&self.bus)
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, |link| link.status())
    }

    fn bus_link(&self) -> Result<Arc<MessageBusLink>, LinkError> {
        lock(&self.bus).clone().ok_or_else(|| {
            debug!("no bus link");
            LinkError::NotConnected
        })
    }

    /// Disconnect both links.
    pub fn shutdown(&self) {
        self.disconnect_transport();
        self.disconnect_bus();
    }

    // ── Operating mode ──────────────────────────────────────────────────────

    /// Fire `event` at the operating state machine. Accepted transitions are
    /// published on [`Topic::Mode`].
    pub fn dispatch(&self, event: ModeEvent) -> Result<Transition, TransitionRejected> {
        let transition = lock(&self.mode).fire(event)?;
        self.mode_tx.send_replace(transition.next);
        self.hub.emit(
            SOURCE,
            EventPayload::ModeChanged {
                previous: transition.previous,
                current: transition.next,
                event,
            },
        );
        Ok(transition)
    }

    pub fn mode(&self) -> OperatingMode {
        lock(&self.mode).current()
    }

    pub fn watch_mode(&self) -> watch::Receiver<OperatingMode> {
        self.mode_tx.subscribe()
    }

    pub fn available_events(&self) -> Vec<ModeEvent> {
        lock(&self.mode).available_events()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("transport", &self.transport_status())
            .field("bus", &self.bus_status())
            .field("mode", &self.mode())
            .finish()
    }
}
