use std::fmt;
use std::time::Duration;

use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};

/// Broker connection parameters.
///
/// Handshake details beyond these (protocol level, QoS) are left to `rumqttc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name or IP
    pub host: String,
    pub port: u16,
    /// Username for MQTT authentication, empty for anonymous access
    pub user: String,
    /// Password for MQTT authentication
    pub password: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Upper bound for a single handshake attempt
    pub handshake_timeout_ms: u64,
    /// Upper bound for flushing one publish/subscribe request
    pub send_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            client_id: "opennode".to_string(),
            keep_alive_secs: 15,
            handshake_timeout_ms: 5000,
            send_timeout_ms: 1000,
        }
    }
}

impl BrokerConfig {
    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs))
            .set_clean_session(true);
        if !self.user.is_empty() {
            options.set_credentials(self.user.clone(), self.password.clone());
        }
        options
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl fmt::Display for BrokerConfig {
    /// Formats as "user@host:port"; the password never shows up in logs.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.user, self.host, self.port)
        }
    }
}

/// Fixed-interval retry budget for broker handshakes.
///
/// `connect()` makes at most `attempts` handshakes and pauses `delay_ms`
/// between two consecutive failures, never after the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u8,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 5000,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u8, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Worst-case time spent inside one `connect()` call, handshakes excluded.
    pub fn worst_case_pause(&self) -> Duration {
        self.delay() * u32::from(self.attempts.saturating_sub(1))
    }
}
