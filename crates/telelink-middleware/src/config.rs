//! Connection parameters consumed by the links.
//!
//! Nothing here is read from disk; the composition root builds a
//! [`LinkConfig`] from its own configuration source and hands it over.

use std::time::Duration;

/// Bounded exponential backoff for socket reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Automatic reconnects allowed after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first reconnect; doubles on every further attempt.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 5;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

    /// Delay before reconnect number `attempt` (zero-based):
    /// `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Every delay the policy will ever schedule, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|a| self.delay_for(a)).collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            base_delay: Self::DEFAULT_BASE_DELAY,
        }
    }
}

/// Command/telemetry socket parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// `ws://host:port/path` of the robot's command socket.
    pub url: String,
    /// Upper bound on a single open attempt.
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Opaque token sent as `Authorization: Bearer …`.
    pub auth_token: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765".to_string(),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            auth_token: None,
        }
    }
}

/// Publish/subscribe bus parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    /// `mqtt://[user[:password]@]host[:port]`.
    pub url: String,
    pub client_id: String,
    /// Robot serial used in command topics.
    pub serial: String,
    /// First segment of robot topics.
    pub namespace: String,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    /// Subscription patterns applied after every successful connect.
    pub topics: Vec<String>,
    /// Sent as the MQTT password when the URL carries none.
    pub auth_token: Option<String>,
}

impl BusConfig {
    /// Wildcard subscriptions covering every robot-related namespace.
    pub fn default_topics(namespace: &str) -> Vec<String> {
        vec![
            format!("{namespace}/#"),
            "robot/#".to_string(),
            "telemetry/#".to_string(),
        ]
    }

    /// `<namespace>/<serial>/<category>`.
    pub fn command_topic(&self, category: &str) -> String {
        format!("{}/{}/{}", self.namespace, self.serial, category)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        let namespace = "temi".to_string();
        Self {
            url: "mqtt://localhost:1883".to_string(),
            client_id: format!("telelink-{}", uuid::Uuid::new_v4().simple()),
            serial: "00000000000".to_string(),
            topics: Self::default_topics(&namespace),
            namespace,
            connect_timeout: Duration::from_secs(12),
            keep_alive: Duration::from_secs(30),
            auth_token: None,
        }
    }
}

/// Navigation (SLAM) subsystem parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationConfig {
    /// `http://host:port` of the SLAM HTTP API.
    pub base_url: String,
    /// Push endpoint; derived from `base_url` when unset.
    pub push_url: Option<String>,
    pub push_timeout: Duration,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub auth_token: Option<String>,
}

/// Shortest period the navigation client polls at, whatever is configured.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl NavigationConfig {
    /// `poll_interval`, raised to [`MIN_POLL_INTERVAL`] when shorter.
    pub fn poll_period(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }

    /// The configured push URL, or `base_url` with a `ws`/`wss` scheme and
    /// a `/ws` path.
    pub fn push_url(&self) -> String {
        if let Some(url) = &self.push_url {
            return url.clone();
        }
        let base = self.base_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws}/ws")
    }
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            push_url: None,
            push_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            auth_token: None,
        }
    }
}

/// Everything the registry and navigation client need.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkConfig {
    pub transport: TransportConfig,
    pub bus: BusConfig,
    pub navigation: NavigationConfig,
}
