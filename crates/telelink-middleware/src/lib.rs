//! `telelink-middleware` – Links & Fan-out
//!
//! Owns every network connection to the robot and routes what arrives to
//! in-process observers without caring what they do with it.
//!
//! # Modules
//!
//! - [`hub`] – [`EventHub`][hub::EventHub]: topic-laned observer fan-out
//!   built on Tokio broadcast channels.
//! - [`config`] – connection parameters ([`LinkConfig`][config::LinkConfig]
//!   and its per-link parts, including the reconnect
//!   [`RetryPolicy`][config::RetryPolicy]).
//! - [`connector`] – the [`SocketConnector`][connector::SocketConnector]
//!   seam and its `tokio-tungstenite` implementation.
//! - [`transport_link`] – [`TransportLink`][transport_link::TransportLink]:
//!   command/telemetry socket with bounded exponential reconnection.
//! - [`message_bus_link`] – [`MessageBusLink`][message_bus_link::MessageBusLink]:
//!   MQTT publish/subscribe, never reconnected automatically.
//! - [`navigation_client`] – [`NavigationClient`][navigation_client::NavigationClient]:
//!   push-or-poll pose feed and goal/cancel requests against the SLAM API.
//! - [`navigation_session`] – [`NavigationSession`][navigation_session::NavigationSession]:
//!   arrival detection on top of the navigation client.
//! - [`registry`] – [`ConnectionRegistry`][registry::ConnectionRegistry]:
//!   the single owner of the process's links and operating mode.

pub mod config;
pub mod connector;
pub mod hub;
pub mod message_bus_link;
pub mod navigation_client;
pub mod navigation_session;
pub mod registry;
pub mod transport_link;

pub use config::{BusConfig, LinkConfig, NavigationConfig, RetryPolicy, TransportConfig};
pub use connector::{SocketConnector, SocketSession, WebSocketConnector};
pub use hub::{EventHub, Topic, TopicReceiver};
pub use message_bus_link::{BusCommand, BusPayload, MessageBusLink};
pub use navigation_client::{HttpNavigationBackend, NavigationBackend, NavigationClient, Strategy};
pub use navigation_session::NavigationSession;
pub use registry::ConnectionRegistry;
pub use transport_link::{RetryState, TransportLink};
