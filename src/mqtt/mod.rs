//! # MQTT Integration Module
//!
//! Bridges the node's local I/O to an MQTT broker. Sensor drivers publish
//! readings by logical name, switch drivers receive state changes through
//! notify callbacks, and this module keeps track of which broker path belongs
//! to which name.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker parameters and retry budget
//! ├── transport.rs        - Transport seam and the rumqttc implementation
//! ├── connection.rs       - Connection state machine, handles, subscription set
//! ├── topic.rs            - Path normalization, topic kinds, registries
//! ├── message_manager.rs  - Inbound message representation and callbacks
//! └── client.rs           - MqttClient: registry and dispatch facade
//! ```
//!
//! ## Threading
//!
//! Everything here runs on the caller's thread. `connect()` blocks for at most
//! `attempts × delay` plus handshake time, `wait_for_messages(t)` for about `t`.
//! A multi-threaded host wraps the [`MqttClient`] in a single `Mutex`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use opennode::mqtt::{BrokerConfig, MqttClient, RetryPolicy, RumqttTransport, SWITCH};
//!
//! let transport = RumqttTransport::new(&BrokerConfig::default());
//! let mut client = MqttClient::new(transport, RetryPolicy::default());
//!
//! client.create_subscribe_topic("porchSwitch", "house/porch/light", SWITCH);
//! client.add_notify_callback("porchSwitch", Arc::new(|topic: &str, message: &str| {
//!     println!("{} -> {}", topic, message);
//!     true
//! }));
//!
//! loop {
//!     client.wait_for_messages(Duration::from_secs(1));
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod message_manager;
pub mod topic;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientStatus, MqttClient};
pub use config::{BrokerConfig, RetryPolicy};
pub use connection::{ConnectionManager, ConnectionState, HandleId, TopicHandle};
pub use message_manager::{enabled_state, InboundMessage, NotifyCallback};
pub use topic::{normalize_path, TopicError, TopicKinds, SENSOR, SWITCH};
pub use transport::{InboundPacket, RumqttTransport, Transport, TransportError};
