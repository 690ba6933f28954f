//! [`CommandSchema`] – the wire-level shape of every message crossing the
//! robot boundary.
//!
//! Outbound: [`validate_outbound`] checks an [`OutboundCommand`] against its
//! variant's constraints and produces the `{type, data, timestamp}` envelope.
//! A command that fails here is never transmitted.
//!
//! Inbound: [`parse_inbound`] / [`validate_envelope`] accept only the known
//! `status` and `chat` message tags; `status` payloads go through
//! [`validate_inbound_telemetry`]. Navigation frames are checked with
//! [`validate_pose`] and [`validate_nav_frame`].
//!
//! Deployments can layer extra constraints on top of the built-in schema by
//! registering [`CommandRule`]s on a [`CommandSchema`].

use serde_json::{Map, Value, json};
use telelink_types::{CommandEnvelope, Obstacle, OutboundCommand, Pose, Telemetry, ValidationError};
use tracing::warn;

/// Longest accepted chat / voice command, in characters, after trimming.
pub const MAX_TEXT_CHARS: usize = 500;

/// Longest accepted navigation label, in characters, after trimming.
pub const MAX_LABEL_CHARS: usize = 100;

const ANGLE_RANGE: (f64, f64) = (0.0, 360.0);
const PERCENT_RANGE: (f64, f64) = (-100.0, 100.0);

// ────────────────────────────────────────────────────────────────────────────
// Outbound
// ────────────────────────────────────────────────────────────────────────────

/// A validated command, ready for the socket.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedCommand {
    pub envelope: CommandEnvelope,
    /// JSON text frame.
    pub text: String,
}

/// Validate `cmd` and serialize it with the current wall-clock timestamp.
pub fn validate_outbound(cmd: &OutboundCommand) -> Result<SerializedCommand, ValidationError> {
    validate_outbound_at(cmd, chrono::Utc::now().timestamp_millis())
}

/// Validate `cmd` and serialize it with an explicit `timestamp` (epoch ms).
pub fn validate_outbound_at(
    cmd: &OutboundCommand,
    timestamp: i64,
) -> Result<SerializedCommand, ValidationError> {
    let data = match cmd {
        OutboundCommand::Move {
            angle,
            speed,
            rotation,
        } => {
            check_range("angle", *angle, ANGLE_RANGE)?;
            check_range("speed", *speed, PERCENT_RANGE)?;
            check_range("rotation", *rotation, PERCENT_RANGE)?;
            json!({ "angle": angle, "speed": speed, "rotation": rotation })
        }
        OutboundCommand::EmergencyStop => json!({}),
        OutboundCommand::Navigate { x, y, theta, label } => {
            check_finite("x", *x)?;
            check_finite("y", *y)?;
            let mut data = Map::new();
            data.insert("x".into(), json!(x));
            data.insert("y".into(), json!(y));
            if let Some(theta) = theta {
                check_finite("theta", *theta)?;
                data.insert("theta".into(), json!(theta));
            }
            if let Some(label) = label {
                let label = label.trim();
                let len = label.chars().count();
                if len > MAX_LABEL_CHARS {
                    return Err(ValidationError::TooLong {
                        field: "label".into(),
                        len,
                        max: MAX_LABEL_CHARS,
                    });
                }
                if !label.is_empty() {
                    data.insert("label".into(), json!(label));
                }
            }
            Value::Object(data)
        }
        OutboundCommand::Chat { command } | OutboundCommand::VoiceCommand { command } => {
            json!({ "command": checked_text("command", command)? })
        }
    };

    let envelope = CommandEnvelope {
        kind: cmd.type_tag().to_string(),
        data,
        timestamp,
    };
    let text = serde_json::to_string(&envelope)
        .map_err(|e| ValidationError::Malformed(e.to_string()))?;
    Ok(SerializedCommand { envelope, text })
}

fn checked_text<'a>(field: &str, text: &'a str) -> Result<&'a str, ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty {
            field: field.into(),
        });
    }
    let len = trimmed.chars().count();
    if len > MAX_TEXT_CHARS {
        return Err(ValidationError::TooLong {
            field: field.into(),
            len,
            max: MAX_TEXT_CHARS,
        });
    }
    Ok(trimmed)
}

fn check_finite(field: &str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NotFinite {
            field: field.into(),
        })
    }
}

fn check_range(field: &str, value: f64, (min, max): (f64, f64)) -> Result<(), ValidationError> {
    check_finite(field, value)?;
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field: field.into(),
            value,
            min,
            max,
        });
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Rule engine
// ────────────────────────────────────────────────────────────────────────────

/// An additional constraint layered over the built-in schema.
pub trait CommandRule: Send + Sync {
    /// Human-readable name used in rejection messages.
    fn name(&self) -> &str;

    /// Return `Ok(())` when the command is acceptable.
    fn check(&self, cmd: &OutboundCommand) -> Result<(), ValidationError>;
}

/// Built-in schema plus any registered [`CommandRule`]s.
///
/// ```
/// use telelink_kernel::command_schema::{CommandSchema, SpeedCapRule};
/// use telelink_types::OutboundCommand;
///
/// let mut schema = CommandSchema::new();
/// schema.add_rule(Box::new(SpeedCapRule { max_speed: 50.0, max_rotation: 50.0 }));
///
/// let gentle = OutboundCommand::Move { angle: 90.0, speed: 40.0, rotation: 0.0 };
/// assert!(schema.validate(&gentle).is_ok());
///
/// let brisk = OutboundCommand::Move { angle: 90.0, speed: 80.0, rotation: 0.0 };
/// assert!(schema.validate(&brisk).is_err());
/// ```
#[derive(Default)]
pub struct CommandSchema {
    rules: Vec<Box<dyn CommandRule>>,
}

impl CommandSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule. Rules run in insertion order after the built-in
    /// checks.
    pub fn add_rule(&mut self, rule: Box<dyn CommandRule>) {
        self.rules.push(rule);
    }

    pub fn validate(&self, cmd: &OutboundCommand) -> Result<SerializedCommand, ValidationError> {
        let serialized = validate_outbound(cmd)?;
        for rule in &self.rules {
            rule.check(cmd)?;
        }
        Ok(serialized)
    }
}

impl std::fmt::Debug for CommandSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.rules.iter().map(|r| r.name()).collect();
        f.debug_struct("CommandSchema").field("rules", &names).finish()
    }
}

/// Caps the magnitude of `Move` speed and rotation below the schema's
/// `[-100, 100]` range.
pub struct SpeedCapRule {
    pub max_speed: f64,
    pub max_rotation: f64,
}

impl CommandRule for SpeedCapRule {
    fn name(&self) -> &str {
        "speed_cap"
    }

    fn check(&self, cmd: &OutboundCommand) -> Result<(), ValidationError> {
        if let OutboundCommand::Move {
            speed, rotation, ..
        } = cmd
        {
            if speed.abs() > self.max_speed {
                return Err(ValidationError::Rule {
                    rule: self.name().to_string(),
                    details: format!("speed {speed} exceeds cap {}", self.max_speed),
                });
            }
            if rotation.abs() > self.max_rotation {
                return Err(ValidationError::Rule {
                    rule: self.name().to_string(),
                    details: format!("rotation {rotation} exceeds cap {}", self.max_rotation),
                });
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inbound
// ────────────────────────────────────────────────────────────────────────────

/// A socket message that passed envelope validation.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Partial telemetry update.
    Status(Telemetry),
    /// Arbitrary chat payload, passed through untouched.
    Chat(Value),
}

/// Parse a JSON text frame and validate its envelope.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, ValidationError> {
    let raw: Value =
        serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    validate_envelope(&raw)
}

/// Check the `{type, data}` envelope and dispatch to the type-specific
/// parser.
pub fn validate_envelope(raw: &Value) -> Result<InboundMessage, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::Malformed("envelope must be a JSON object".into()))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::Malformed("envelope has no 'type' tag".into()))?;
    let data = obj
        .get("data")
        .ok_or_else(|| ValidationError::Malformed("envelope has no 'data' member".into()))?;

    match kind {
        "status" => validate_inbound_telemetry(data).map(InboundMessage::Status),
        "chat" => Ok(InboundMessage::Chat(data.clone())),
        other => Err(ValidationError::UnknownType(other.to_string())),
    }
}

/// Validate a partial telemetry object.
///
/// Any subset of the known fields is accepted and unknown fields are ignored.
/// A known field that is non-numeric or out of range is dropped on its own;
/// only a `data` member that is not an object rejects the record.
pub fn validate_inbound_telemetry(raw: &Value) -> Result<Telemetry, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::Malformed("telemetry must be a JSON object".into()))?;

    let field = |name: &str, range: Option<(f64, f64)>| -> Option<f64> {
        read_number(obj, name, range).unwrap_or_else(|e| {
            warn!(field = name, error = %e, "telemetry field dropped");
            None
        })
    };

    Ok(Telemetry {
        battery: field("battery", Some((0.0, 100.0))),
        temperature: field("temperature", Some((-50.0, 150.0))),
        wifi_strength: field("wifiStrength", Some((0.0, 5.0))),
        speed: field("speed", None),
        orientation: field("orientation", Some(ANGLE_RANGE)),
        pos_x: field("posX", None),
        pos_y: field("posY", None),
        motor_left: field("motorLeft", Some(PERCENT_RANGE)),
        motor_right: field("motorRight", Some(PERCENT_RANGE)),
        odometry: field("odometry", None),
        power_consumption: field("powerConsumption", Some((0.0, f64::MAX))),
    })
}

/// `null` counts as absent.
fn read_number(
    obj: &Map<String, Value>,
    field: &str,
    range: Option<(f64, f64)>,
) -> Result<Option<f64>, ValidationError> {
    let value = match obj.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(v) => v.as_f64().ok_or_else(|| ValidationError::NotANumber {
            field: field.into(),
        })?,
    };
    match range {
        Some(range) => check_range(field, value, range)?,
        None => check_finite(field, value)?,
    }
    Ok(Some(value))
}

fn require_number(obj: &Map<String, Value>, field: &str) -> Result<f64, ValidationError> {
    read_number(obj, field, None)?.ok_or_else(|| ValidationError::Malformed(format!("missing '{field}'")))
}

/// Validate a pose record from the navigation subsystem.
///
/// `x`, `y` and `theta` are required; a missing `timestamp` is filled with
/// `now_ms`, a missing `quality` with `0.0`.
pub fn validate_pose(raw: &Value, now_ms: i64) -> Result<Pose, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::Malformed("pose must be a JSON object".into()))?;
    let timestamp = match read_number(obj, "timestamp", Some((0.0, f64::MAX)))? {
        Some(ts) => ts as i64,
        None => now_ms,
    };
    Ok(Pose {
        x: require_number(obj, "x")?,
        y: require_number(obj, "y")?,
        theta: require_number(obj, "theta")?,
        timestamp,
        quality: read_number(obj, "quality", None)?.unwrap_or(0.0),
    })
}

/// Validate an obstacle list.
pub fn validate_obstacles(raw: &Value) -> Result<Vec<Obstacle>, ValidationError> {
    let items = raw
        .as_array()
        .ok_or_else(|| ValidationError::Malformed("obstacles must be a JSON array".into()))?;
    items
        .iter()
        .map(|item| -> Result<Obstacle, ValidationError> {
            let obstacle: Obstacle = serde_json::from_value(item.clone())
                .map_err(|e| ValidationError::Malformed(format!("obstacle: {e}")))?;
            check_finite("x", obstacle.x)?;
            check_finite("y", obstacle.y)?;
            if let Some(radius) = obstacle.radius {
                check_range("radius", radius, (0.0, f64::MAX))?;
            }
            Ok(obstacle)
        })
        .collect()
}

/// One push-channel frame from the navigation subsystem.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NavFrame {
    pub pose: Option<Pose>,
    pub obstacles: Vec<Obstacle>,
}

/// Validate a `{pose?, obstacles?}` frame.
pub fn validate_nav_frame(raw: &Value, now_ms: i64) -> Result<NavFrame, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::Malformed("navigation frame must be a JSON object".into()))?;
    let pose = match obj.get("pose") {
        None | Some(Value::Null) => None,
        Some(p) => Some(validate_pose(p, now_ms)?),
    };
    let obstacles = match obj.get("obstacles") {
        None | Some(Value::Null) => Vec::new(),
        Some(o) => validate_obstacles(o)?,
    };
    Ok(NavFrame { pose, obstacles })
}
