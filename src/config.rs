//! Node configuration file.
//!
//! One TOML file describes the broker, the retry budget, extra topic kinds and
//! the topics to register at startup:
//!
//! ```toml
//! [broker]
//! host = "192.168.1.10"
//! user = "node"
//! password = "secret"
//!
//! [retry]
//! attempts = 3
//! delay_ms = 5000
//!
//! [[publish]]
//! name = "kitchenTemp"
//! path = "house/kitchen/temperature"
//!
//! [[subscribe]]
//! name = "porchSwitch"
//! path = "house/porch/light"
//! kind = "switch"
//! echo_path = "house/porch/light/state"
//! ```
//!
//! Missing sections fall back to defaults, so an empty file is a valid config.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::mqtt::{
    enabled_state, BrokerConfig, MqttClient, NotifyCallback, RetryPolicy, TopicKinds, Transport,
    SENSOR, SWITCH,
};

const CONFIG_DIR: &str = "opennode";
const CONFIG_FILE: &str = "node.toml";
const CONFIG_ENV: &str = "OPENNODE_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("broker host must not be empty")]
    EmptyHost,

    #[error("broker port must not be 0")]
    ZeroPort,

    #[error("keep-alive must be at least 5 seconds, got {0}")]
    KeepAliveTooShort(u64),

    #[error("retry attempts must be at least 1")]
    NoAttempts,

    #[error("{0} topic without a name")]
    UnnamedTopic(&'static str),

    #[error("{0} topic '{1}' is listed twice")]
    DuplicateTopic(&'static str, String),

    #[error("topic '{0}' uses unknown kind '{1}'")]
    UnknownKind(String, String),
}

/// Loop settings of the firmware binary.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct NodeSettings {
    /// Upper bound of one `wait_for_messages` call
    pub poll_timeout_ms: u64,
    /// Used when `RUST_LOG` is not set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Stop after this many loop iterations; runs forever when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 1000,
            log_level: None,
            max_iterations: None,
        }
    }
}

fn default_kind() -> String {
    SENSOR.to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PublishTopicConfig {
    pub name: String,
    pub path: String,
    #[serde(default = "default_kind")]
    pub kind: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SubscribeTopicConfig {
    pub name: String,
    pub path: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Registers a publish topic of the same name here, which receives the
    /// decoded state of every inbound message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo_path: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    pub broker: BrokerConfig,
    pub retry: RetryPolicy,
    pub node: NodeSettings,
    /// Extra topic kinds: kind name → path prefix
    pub kinds: BTreeMap<String, String>,
    pub publish: Vec<PublishTopicConfig>,
    pub subscribe: Vec<SubscribeTopicConfig>,
}

impl NodeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse node config: {}", e))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize node config: {}", e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded node config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        std::fs::write(path, self.to_toml_string()?)
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))
    }

    /// Writes the default config to `path` unless a file is already there.
    ///
    /// Returns whether a file was written.
    pub fn ensure_default(path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        info!("Creating default configuration at {}", path.display());
        Self::default().save(path)?;
        Ok(true)
    }

    /// `<config dir>/opennode/node.toml`, falling back to the home directory.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            let mut home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            home.push(".config");
            home
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Command line argument first, then `OPENNODE_CONFIG`, then the default.
    pub fn resolve_path(arg: Option<String>) -> PathBuf {
        arg.or_else(|| std::env::var(CONFIG_ENV).ok())
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_path)
    }

    /// Built-in kinds with the `[kinds]` table merged over them.
    pub fn topic_kinds(&self) -> TopicKinds {
        let mut kinds = TopicKinds::default();
        for (kind, prefix) in &self.kinds {
            kinds.register(kind.clone(), prefix.clone());
        }
        kinds
    }

    /// Registers every configured topic on `client`.
    ///
    /// Switch subscriptions get a callback that logs the requested state.
    /// Returns how many registrations failed.
    pub fn register_topics<T: Transport>(&self, client: &mut MqttClient<T>) -> usize {
        let mut failed = 0;
        for topic in &self.publish {
            if !client.create_publish_topic(&topic.name, &topic.path, &topic.kind) {
                failed += 1;
            }
        }
        for topic in &self.subscribe {
            if !client.create_subscribe_topic(&topic.name, &topic.path, &topic.kind) {
                failed += 1;
                continue;
            }
            if let Some(echo_path) = &topic.echo_path {
                if !client.create_publish_topic(&topic.name, echo_path, &topic.kind) {
                    warn!("Topic '{}' will not echo its state", topic.name);
                    failed += 1;
                }
            }
            if topic.kind == SWITCH && !client.add_notify_callback(&topic.name, switch_logger()) {
                failed += 1;
            }
        }
        failed
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.broker.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.broker.keep_alive_secs < 5 {
            return Err(ConfigError::KeepAliveTooShort(self.broker.keep_alive_secs));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }

        let kinds = self.topic_kinds();
        let publish = self.publish.iter().map(|t| (t.name.as_str(), t.kind.as_str()));
        let subscribe = self.subscribe.iter().map(|t| (t.name.as_str(), t.kind.as_str()));
        check_topics("publish", publish, &kinds)?;
        check_topics("subscribe", subscribe, &kinds)?;
        Ok(())
    }
}

fn switch_logger() -> NotifyCallback {
    Arc::new(|topic: &str, message: &str| {
        let on = enabled_state(message);
        info!("'{}' requested {}", topic, if on { "ON" } else { "OFF" });
        on
    })
}

fn check_topics<'a>(
    list: &'static str,
    topics: impl Iterator<Item = (&'a str, &'a str)>,
    kinds: &TopicKinds,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for (name, kind) in topics {
        if name.is_empty() {
            return Err(ConfigError::UnnamedTopic(list));
        }
        if !seen.insert(name) {
            return Err(ConfigError::DuplicateTopic(list, name.to_string()));
        }
        if !kinds.contains(kind) {
            return Err(ConfigError::UnknownKind(name.to_string(), kind.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::ScriptedTransport;
    use std::time::Duration;

    const SAMPLE: &str = r#"
        [broker]
        host = "192.168.1.10"
        user = "node"
        password = "secret"

        [retry]
        attempts = 5
        delay_ms = 2000

        [node]
        poll_timeout_ms = 250

        [kinds]
        climate = "hvac"

        [[publish]]
        name = "kitchenTemp"
        path = "house/kitchen/temperature"

        [[subscribe]]
        name = "porchSwitch"
        path = "house/porch/light"
        kind = "switch"
        echo_path = "house/porch/light/state"
    "#;

    #[test]
    fn empty_file_is_default() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sample_parses_with_defaults_filled_in() {
        let config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.broker.host, "192.168.1.10");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.retry, RetryPolicy::new(5, std::time::Duration::from_secs(2)));
        assert_eq!(config.node.poll_timeout_ms, 250);
        assert_eq!(config.publish[0].kind, SENSOR);
        assert_eq!(config.subscribe[0].kind, SWITCH);
        assert_eq!(
            config.subscribe[0].echo_path.as_deref(),
            Some("house/porch/light/state")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn kinds_table_extends_builtins() {
        let config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        let kinds = config.topic_kinds();
        assert_eq!(kinds.prefix("climate"), Some("hvac"));
        assert_eq!(kinds.prefix(SWITCH), Some("switch"));
    }

    #[test]
    fn validation_catches_broken_entries() {
        let mut config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        config.retry.attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoAttempts));

        let mut config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        config.publish.push(config.publish[0].clone());
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateTopic("publish", "kitchenTemp".to_string()))
        );

        let mut config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        config.subscribe[0].kind = "relay".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownKind("porchSwitch".to_string(), "relay".to_string()))
        );

        let mut config = NodeConfig::default();
        config.broker.host = " ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyHost));
    }

    #[test]
    fn same_name_in_both_lists_is_fine() {
        let mut config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        config.publish[0].name = "porchSwitch".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn register_topics_wires_echo_and_callbacks() {
        let config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        let mut client = MqttClient::new(ScriptedTransport::default(), config.retry.clone())
            .with_kinds(config.topic_kinds());

        assert_eq!(config.register_topics(&mut client), 0);
        assert_eq!(
            client.publish_topic("kitchenTemp").unwrap().path(),
            "/sensor/house/kitchen/temperature"
        );
        assert_eq!(
            client.publish_topic("porchSwitch").unwrap().path(),
            "/switch/house/porch/light/state"
        );
        assert!(client.notify_callback("porchSwitch").is_some());
        assert_eq!(client.connection().subscription_count(), 1);
    }

    #[test]
    fn register_topics_counts_conflicts() {
        let mut config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        config.publish[0].name = "porchSwitch".to_string();
        let mut client = MqttClient::new(
            ScriptedTransport::default(),
            RetryPolicy::new(1, Duration::ZERO),
        );

        // the echo topic collides with the plain publish entry
        assert_eq!(config.register_topics(&mut client), 1);
        assert_eq!(
            client.publish_topic("porchSwitch").unwrap().path(),
            "/sensor/house/kitchen/temperature"
        );
    }

    #[test]
    fn unknown_field_types_are_rejected() {
        assert!(NodeConfig::from_toml_str("[broker]\nport = \"high\"").is_err());
    }

    #[test]
    fn ensure_default_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        assert!(NodeConfig::ensure_default(&path).unwrap());
        assert!(!NodeConfig::ensure_default(&path).unwrap());
        assert_eq!(NodeConfig::load(&path).unwrap(), NodeConfig::default());
    }

    #[test]
    fn save_and_load_keep_topics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let config = NodeConfig::from_toml_str(SAMPLE).unwrap();

        config.save(&path).unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn explicit_argument_wins() {
        let path = NodeConfig::resolve_path(Some("/tmp/custom.toml".to_string()));
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
        assert!(NodeConfig::default_path().ends_with("opennode/node.toml"));
    }
}
