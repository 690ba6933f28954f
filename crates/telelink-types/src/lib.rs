//! `telelink-types` – shared vocabulary of the Telelink workspace.
//!
//! Everything that crosses a crate boundary lives here: connection status,
//! outbound commands, inbound telemetry and pose records, the operating-mode
//! enums, the [`Event`] envelope routed through the observer hub, and the
//! error taxonomy.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Connection status
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a single link (socket, bus, or navigation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

/// Identifies which link produced a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Command/telemetry WebSocket.
    Transport,
    /// Publish/subscribe message bus.
    Bus,
    /// Navigation (SLAM) subsystem.
    Navigation,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Transport => write!(f, "transport"),
            LinkKind::Bus => write!(f, "bus"),
            LinkKind::Navigation => write!(f, "navigation"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound commands
// ────────────────────────────────────────────────────────────────────────────

/// Every command the companion app may send to the robot.
///
/// Construct freely, but only transmit after `telelink-kernel`'s command
/// schema has accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundCommand {
    /// Joystick-style drive command.
    Move {
        /// Heading in degrees, `[0, 360]`.
        angle: f64,
        /// Signed speed percentage, `[-100, 100]`.
        speed: f64,
        /// Signed rotation percentage, `[-100, 100]`.
        rotation: f64,
    },
    /// Stop all motion immediately.
    EmergencyStop,
    /// Ask the robot to drive to a map coordinate.
    Navigate {
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        theta: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// Typed chat line forwarded to the robot.
    Chat { command: String },
    /// Transcribed voice command.
    VoiceCommand { command: String },
}

impl OutboundCommand {
    /// Wire-level type tag used in the outbound envelope.
    pub fn type_tag(&self) -> &'static str {
        match self {
            OutboundCommand::Move { .. } => "move",
            OutboundCommand::EmergencyStop => "emergency_stop",
            OutboundCommand::Navigate { .. } => "navigate",
            OutboundCommand::Chat { .. } => "chat",
            OutboundCommand::VoiceCommand { .. } => "voice_command",
        }
    }
}

/// Outer `{type, data, timestamp}` wrapper written to the command socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

// ────────────────────────────────────────────────────────────────────────────
// Inbound telemetry
// ────────────────────────────────────────────────────────────────────────────

/// Sparse robot telemetry record.
///
/// Inbound `status` messages carry any subset of these fields; they are
/// merged into the last-known snapshot with [`Telemetry::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motor_left: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motor_right: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odometry: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_consumption: Option<f64>,
}

impl Telemetry {
    /// Overwrite every field that is set in `update`, leaving the rest alone.
    pub fn merge(&mut self, update: &Telemetry) {
        fn take(slot: &mut Option<f64>, value: Option<f64>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.battery, update.battery);
        take(&mut self.temperature, update.temperature);
        take(&mut self.wifi_strength, update.wifi_strength);
        take(&mut self.speed, update.speed);
        take(&mut self.orientation, update.orientation);
        take(&mut self.pos_x, update.pos_x);
        take(&mut self.pos_y, update.pos_y);
        take(&mut self.motor_left, update.motor_left);
        take(&mut self.motor_right, update.motor_right);
        take(&mut self.odometry, update.odometry);
        take(&mut self.power_consumption, update.power_consumption);
    }

    /// `true` when no field has ever been reported.
    pub fn is_empty(&self) -> bool {
        *self == Telemetry::default()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Navigation data
// ────────────────────────────────────────────────────────────────────────────

/// Robot pose as reported by the navigation subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    /// Heading in radians.
    pub theta: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Localisation quality as reported by SLAM.
    #[serde(default)]
    pub quality: f64,
}

impl Pose {
    /// Planar Euclidean distance from this pose to `(x, y)`.
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        (self.x - x).hypot(self.y - y)
    }
}

/// Destination of an in-progress navigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavTarget {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl NavTarget {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, label: None }
    }

    /// Builder-style label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObstacleKind {
    Static,
    Dynamic,
}

/// Obstacle reported alongside a pose update. Never retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    #[serde(rename = "type")]
    pub kind: ObstacleKind,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
}

/// One waypoint of the planned path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    pub x: f64,
    pub y: f64,
}

/// Occupancy grid published by the SLAM subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyMap {
    pub width: u32,
    pub height: u32,
    /// Metres per cell.
    pub resolution: f64,
    #[serde(default)]
    pub origin_x: f64,
    #[serde(default)]
    pub origin_y: f64,
    #[serde(default)]
    pub data: Vec<i8>,
}

// ────────────────────────────────────────────────────────────────────────────
// Operating modes
// ────────────────────────────────────────────────────────────────────────────

/// High-level behavioural state of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    #[default]
    Idle,
    Reception,
    Delivery,
    Charging,
    Error,
}

impl OperatingMode {
    pub const ALL: [OperatingMode; 5] = [
        OperatingMode::Idle,
        OperatingMode::Reception,
        OperatingMode::Delivery,
        OperatingMode::Charging,
        OperatingMode::Error,
    ];
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Idle => write!(f, "IDLE"),
            OperatingMode::Reception => write!(f, "RECEPTION"),
            OperatingMode::Delivery => write!(f, "DELIVERY"),
            OperatingMode::Charging => write!(f, "CHARGING"),
            OperatingMode::Error => write!(f, "ERROR"),
        }
    }
}

/// Discrete events that drive [`OperatingMode`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeEvent {
    StartReception,
    StopReception,
    StartDelivery,
    CompleteDelivery,
    CancelDelivery,
    StartCharging,
    Resume,
    Interrupt,
    Fault,
    Reset,
}

impl ModeEvent {
    pub const ALL: [ModeEvent; 10] = [
        ModeEvent::StartReception,
        ModeEvent::StopReception,
        ModeEvent::StartDelivery,
        ModeEvent::CompleteDelivery,
        ModeEvent::CancelDelivery,
        ModeEvent::StartCharging,
        ModeEvent::Resume,
        ModeEvent::Interrupt,
        ModeEvent::Fault,
        ModeEvent::Reset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModeEvent::StartReception => "start_reception",
            ModeEvent::StopReception => "stop_reception",
            ModeEvent::StartDelivery => "start_delivery",
            ModeEvent::CompleteDelivery => "complete_delivery",
            ModeEvent::CancelDelivery => "cancel_delivery",
            ModeEvent::StartCharging => "start_charging",
            ModeEvent::Resume => "resume",
            ModeEvent::Interrupt => "interrupt",
            ModeEvent::Fault => "fault",
            ModeEvent::Reset => "reset",
        }
    }
}

impl fmt::Display for ModeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModeEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        ModeEvent::ALL
            .into_iter()
            .find(|e| e.as_str() == wanted)
            .ok_or_else(|| format!("unknown mode event '{s}'"))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Observer events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper fanned out to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "telelink-middleware::transport"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Status {
        link: LinkKind,
        status: ConnectionStatus,
    },
    /// Full telemetry snapshot after a merge.
    Telemetry(Telemetry),
    /// Opaque chat payload passed through from the robot.
    Chat(serde_json::Value),
    /// Raw message received on the publish/subscribe bus.
    BusMessage { topic: String, payload: String },
    Pose(Pose),
    Obstacles(Vec<Obstacle>),
    Arrived(NavTarget),
    ModeChanged {
        previous: OperatingMode,
        current: OperatingMode,
        event: ModeEvent,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// A payload failed schema validation; it is dropped, never transmitted or
/// applied.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("field '{field}' must be a number")]
    NotANumber { field: String },

    #[error("field '{field}' must be finite")]
    NotFinite { field: String },

    #[error("field '{field}' value {value} outside [{min}, {max}]")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("field '{field}' is empty")]
    Empty { field: String },

    #[error("field '{field}' is {len} characters, exceeding the limit of {max}")]
    TooLong { field: String, len: usize, max: usize },

    #[error("rule '{rule}' rejected command: {details}")]
    Rule { rule: String, details: String },
}

/// Transport-level failure surfaced by a link.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connect attempt timed out after {0} ms")]
    Timeout(u64),

    #[error("link is not connected")]
    NotConnected,

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LinkError {
    /// Connection failures and timeouts both count as failed attempts.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, LinkError::Connection(_) | LinkError::Timeout(_))
    }
}

/// An event was fired in a mode that does not accept it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[error("event '{event}' is not accepted in mode {mode}")]
pub struct TransitionRejected {
    pub mode: OperatingMode,
    pub event: ModeEvent,
}
