//! Configuration vault: reads/writes `~/.telelink/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use telelink_kernel::{CommandSchema, SpeedCapRule};
use telelink_middleware::{BusConfig, LinkConfig, NavigationConfig, RetryPolicy, TransportConfig};
use tracing::warn;
use zeroize::Zeroize;

/// Persisted operator configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Command/telemetry WebSocket.
    #[serde(default = "default_socket_url")]
    pub socket_url: String,

    /// Message bus broker, `mqtt://host:port`.
    #[serde(default = "default_bus_url")]
    pub bus_url: String,

    /// Robot serial used in bus command topics.
    #[serde(default = "default_serial")]
    pub serial: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Base URL of the navigation HTTP API.
    #[serde(default = "default_nav_url")]
    pub nav_url: String,

    /// Bearer token shared by every link. Wiped from memory on drop.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_token: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_bus_timeout_ms")]
    pub bus_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Operator cap on `move` speed magnitude, tighter than the protocol's
    /// 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_speed: Option<f64>,

    /// Operator cap on `move` rotation magnitude.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rotation: Option<f64>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("socket_url", &self.socket_url)
            .field("bus_url", &self.bus_url)
            .field("serial", &self.serial)
            .field("namespace", &self.namespace)
            .field("nav_url", &self.nav_url)
            .field(
                "auth_token",
                if self.auth_token.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("max_retries", &self.max_retries)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("bus_timeout_ms", &self.bus_timeout_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_speed", &self.max_speed)
            .field("max_rotation", &self.max_rotation)
            .finish()
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        self.auth_token.zeroize();
    }
}

fn default_socket_url() -> String {
    TransportConfig::default().url
}
fn default_bus_url() -> String {
    BusConfig::default().url
}
fn default_serial() -> String {
    BusConfig::default().serial
}
fn default_namespace() -> String {
    BusConfig::default().namespace
}
fn default_nav_url() -> String {
    NavigationConfig::default().base_url
}
fn default_max_retries() -> u32 {
    RetryPolicy::DEFAULT_MAX_RETRIES
}
fn default_backoff_base_ms() -> u64 {
    RetryPolicy::DEFAULT_BASE_DELAY.as_millis() as u64
}
fn default_connect_timeout_ms() -> u64 {
    TransportConfig::default().connect_timeout.as_millis() as u64
}
fn default_bus_timeout_ms() -> u64 {
    BusConfig::default().connect_timeout.as_millis() as u64
}
fn default_poll_interval_ms() -> u64 {
    NavigationConfig::default().poll_interval.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_url: default_socket_url(),
            bus_url: default_bus_url(),
            serial: default_serial(),
            namespace: default_namespace(),
            nav_url: default_nav_url(),
            auth_token: String::new(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            bus_timeout_ms: default_bus_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_speed: None,
            max_rotation: None,
        }
    }
}

/// Magnitude of every protocol-valid `move` speed and rotation.
const MOVE_LIMIT: f64 = 100.0;

/// A usable cap, or `None` (with a warning) for one that would block every
/// move.
fn move_cap(field: &str, cap: Option<f64>) -> Option<f64> {
    let cap = cap?;
    if cap.is_finite() && cap > 0.0 {
        Some(cap.min(MOVE_LIMIT))
    } else {
        warn!(field, cap, "ignoring move cap; it must be a positive number");
        None
    }
}

/// `ms` as a duration. Zero is not a usable period or timeout, so it falls
/// back to `default_ms`.
fn positive_millis(field: &str, ms: u64, default_ms: u64) -> Duration {
    if ms == 0 {
        warn!(field, default_ms, "zero duration in config; using the default");
        return Duration::from_millis(default_ms);
    }
    Duration::from_millis(ms)
}

impl Config {
    fn token(&self) -> Option<String> {
        (!self.auth_token.is_empty()).then(|| self.auth_token.clone())
    }

    /// Outbound command schema, with a [`SpeedCapRule`] when either move cap
    /// is configured.
    pub fn command_schema(&self) -> CommandSchema {
        let mut schema = CommandSchema::new();
        let max_speed = move_cap("max_speed", self.max_speed);
        let max_rotation = move_cap("max_rotation", self.max_rotation);
        if max_speed.is_some() || max_rotation.is_some() {
            schema.add_rule(Box::new(SpeedCapRule {
                max_speed: max_speed.unwrap_or(MOVE_LIMIT),
                max_rotation: max_rotation.unwrap_or(MOVE_LIMIT),
            }));
        }
        schema
    }

    /// Link parameters for the middleware.
    pub fn link_config(&self) -> LinkConfig {
        let transport = TransportConfig {
            url: self.socket_url.clone(),
            connect_timeout: positive_millis(
                "connect_timeout_ms",
                self.connect_timeout_ms,
                default_connect_timeout_ms(),
            ),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: positive_millis(
                    "backoff_base_ms",
                    self.backoff_base_ms,
                    default_backoff_base_ms(),
                ),
            },
            auth_token: self.token(),
        };

        let mut bus = BusConfig::default();
        bus.url = self.bus_url.clone();
        bus.serial = self.serial.clone();
        bus.topics = BusConfig::default_topics(&self.namespace);
        bus.namespace = self.namespace.clone();
        bus.connect_timeout =
            positive_millis("bus_timeout_ms", self.bus_timeout_ms, default_bus_timeout_ms());
        bus.auth_token = self.token();

        let mut navigation = NavigationConfig::default();
        navigation.base_url = self.nav_url.clone();
        navigation.poll_interval = positive_millis(
            "poll_interval_ms",
            self.poll_interval_ms,
            default_poll_interval_ms(),
        );
        navigation.auth_token = self.token();

        LinkConfig {
            transport,
            bus,
            navigation,
        }
    }
}

/// Return the path to `~/.telelink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".telelink").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `TELELINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TELELINK_SOCKET_URL` | `socket_url` |
/// | `TELELINK_BUS_URL` | `bus_url` |
/// | `TELELINK_SERIAL` | `serial` |
/// | `TELELINK_NAMESPACE` | `namespace` |
/// | `TELELINK_NAV_URL` | `nav_url` |
/// | `TELELINK_AUTH_TOKEN` | `auth_token` |
/// | `TELELINK_MAX_RETRIES` | `max_retries` |
/// | `TELELINK_BACKOFF_BASE_MS` | `backoff_base_ms` |
/// | `TELELINK_CONNECT_TIMEOUT_MS` | `connect_timeout_ms` |
/// | `TELELINK_BUS_TIMEOUT_MS` | `bus_timeout_ms` |
/// | `TELELINK_POLL_INTERVAL_MS` | `poll_interval_ms` |
/// | `TELELINK_MAX_SPEED` | `max_speed` |
/// | `TELELINK_MAX_ROTATION` | `max_rotation` |
///
/// Numeric overrides that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    let strings: [(&str, &mut String); 6] = [
        ("TELELINK_SOCKET_URL", &mut cfg.socket_url),
        ("TELELINK_BUS_URL", &mut cfg.bus_url),
        ("TELELINK_SERIAL", &mut cfg.serial),
        ("TELELINK_NAMESPACE", &mut cfg.namespace),
        ("TELELINK_NAV_URL", &mut cfg.nav_url),
        ("TELELINK_AUTH_TOKEN", &mut cfg.auth_token),
    ];
    for (var, field) in strings {
        if let Ok(v) = std::env::var(var) {
            field.zeroize();
            *field = v;
        }
    }

    if let Ok(v) = std::env::var("TELELINK_MAX_RETRIES")
        && let Ok(n) = v.parse::<u32>()
    {
        cfg.max_retries = n;
    }
    let millis: [(&str, &mut u64); 4] = [
        ("TELELINK_BACKOFF_BASE_MS", &mut cfg.backoff_base_ms),
        ("TELELINK_CONNECT_TIMEOUT_MS", &mut cfg.connect_timeout_ms),
        ("TELELINK_BUS_TIMEOUT_MS", &mut cfg.bus_timeout_ms),
        ("TELELINK_POLL_INTERVAL_MS", &mut cfg.poll_interval_ms),
    ];
    for (var, field) in millis {
        if let Ok(v) = std::env::var(var)
            && let Ok(ms) = v.parse::<u64>()
        {
            *field = ms;
        }
    }
    let caps: [(&str, &mut Option<f64>); 2] = [
        ("TELELINK_MAX_SPEED", &mut cfg.max_speed),
        ("TELELINK_MAX_ROTATION", &mut cfg.max_rotation),
    ];
    for (var, field) in caps {
        if let Ok(v) = std::env::var(var)
            && let Ok(cap) = v.parse::<f64>()
        {
            *field = Some(cap);
        }
    }
}

/// Save the config to disk, creating `~/.telelink/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------): the file may hold the auth token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let mut raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    let written = {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
    };
    #[cfg(not(unix))]
    let written = fs::write(path, &raw);
    raw.zeroize();
    written.map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}
