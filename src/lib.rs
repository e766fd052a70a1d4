//! Firmware-side MQTT topic manager for a switch/sensor node.
//!
//! [`mqtt`] holds the broker link, topic registry and dispatch; [`config`]
//! loads the node's TOML configuration.

pub mod config;
pub mod mqtt;
