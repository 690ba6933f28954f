//! In-process observer fan-out.
//!
//! Uses [`tokio::sync::broadcast`] channels so every observer receives every
//! event without any single observer blocking the links that produce them.
//! The hub outlives individual links: observers subscribe once and keep
//! receiving after a link is torn down and rebuilt.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Status`] | Connection status changes of every link |
//! | [`Topic::Telemetry`] | Merged telemetry snapshots from the command socket |
//! | [`Topic::Chat`] | Chat payloads passed through from the robot |
//! | [`Topic::BusTraffic`] | Raw messages received on the publish/subscribe bus |
//! | [`Topic::Navigation`] | Pose, obstacle and arrival events |
//! | [`Topic::Mode`] | Accepted operating-mode transitions |

use telelink_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow observers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes of the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Status,
    Telemetry,
    Chat,
    BusTraffic,
    Navigation,
    Mode,
}

impl Topic {
    /// The lane an event payload belongs on.
    pub fn of(payload: &EventPayload) -> Topic {
        match payload {
            EventPayload::Status { .. } => Topic::Status,
            EventPayload::Telemetry(_) => Topic::Telemetry,
            EventPayload::Chat(_) => Topic::Chat,
            EventPayload::BusMessage { .. } => Topic::BusTraffic,
            EventPayload::Pose(_) | EventPayload::Obstacles(_) | EventPayload::Arrived(_) => {
                Topic::Navigation
            }
            EventPayload::ModeChanged { .. } => Topic::Mode,
        }
    }
}

/// Shared observer hub. Clone it cheaply – all clones share the same
/// underlying broadcast channels.
///
/// Every event goes to its topic lane and to the firehose returned by
/// [`EventHub::subscribe`].
#[derive(Clone, Debug)]
pub struct EventHub {
    all: broadcast::Sender<Event>,
    status: broadcast::Sender<Event>,
    telemetry: broadcast::Sender<Event>,
    chat: broadcast::Sender<Event>,
    bus_traffic: broadcast::Sender<Event>,
    navigation: broadcast::Sender<Event>,
    mode: broadcast::Sender<Event>,
}

impl EventHub {
    /// Create a hub with the given per-lane capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            all: broadcast::channel(capacity).0,
            status: broadcast::channel(capacity).0,
            telemetry: broadcast::channel(capacity).0,
            chat: broadcast::channel(capacity).0,
            bus_traffic: broadcast::channel(capacity).0,
            navigation: broadcast::channel(capacity).0,
            mode: broadcast::channel(capacity).0,
        }
    }

    /// Publish `event` on its topic lane and on the firehose.
    ///
    /// Returns the number of observers that were handed the event. Having no
    /// observers is normal and yields `0`.
    pub fn publish(&self, event: Event) -> usize {
        let lane = self.topic_sender(Topic::of(&event.payload));
        let on_lane = lane.send(event.clone()).unwrap_or(0);
        let on_firehose = self.all.send(event).unwrap_or(0);
        on_lane + on_firehose
    }

    /// Stamp `payload` into a fresh [`Event`] from `source` and publish it.
    pub fn emit(&self, source: &str, payload: EventPayload) -> usize {
        self.publish(Event::new(source, payload))
    }

    /// Subscribe to a single lane.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event regardless of lane.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Status => &self.status,
            Topic::Telemetry => &self.telemetry,
            Topic::Chat => &self.chat,
            Topic::BusTraffic => &self.bus_traffic,
            Topic::Navigation => &self.navigation,
            Topic::Mode => &self.mode,
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] lane.
///
/// Obtained via [`EventHub::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this lane.
    ///
    /// Surfaces `Lagged(n)` so the caller can decide what a gap means.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event, logging and skipping over lag.
    ///
    /// Returns `None` once the hub has shut down.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
