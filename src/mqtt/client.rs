//! Node-facing MQTT client: topic registry plus message dispatch.
//!
//! [`MqttClient`] is the single component the firmware talks to. Every public
//! operation answers with a plain `bool` and logs why it failed; typed errors
//! stay inside the module.
//!
//! ```text
//! publish(name, msg) ──► connect ──► publish registry ──► handle check ──► send
//! wait_for_messages  ──► connect ──► read subscription ──► subscribe registry
//!                                                             │
//!                                               echo on publish handle + callback
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, error, info, trace, warn};

use super::config::RetryPolicy;
use super::connection::{
    ConnectionManager, ConnectionState, Delivery, PublishHandle, SubscribeHandle, TopicHandle,
};
use super::message_manager::{state_message, InboundMessage, NotifyCallback};
use super::topic::{TopicError, TopicKinds, TopicRecord, TopicRegistry};
use super::transport::Transport;

/// Traffic counters and link state of one client.
#[derive(Clone, Debug, Default)]
pub struct ClientStatus {
    pub connection_state: ConnectionState,
    pub connection_attempts: u64,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub failed_sends: usize,
    /// Inbound packets that matched no live subscription
    pub dropped_messages: u64,
    pub last_activity: Option<DateTime<Local>>,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s), {} received, {} sent, {} failed, {} dropped",
            self.connection_state,
            self.connection_attempts,
            self.messages_received,
            self.messages_sent,
            self.failed_sends,
            self.dropped_messages
        )?;
        if let Some(last) = self.last_activity {
            write!(f, ", last activity {}", last.format("%Y-%m-%d %H:%M:%S"))?;
        }
        Ok(())
    }
}

pub struct MqttClient<T: Transport> {
    connection: ConnectionManager<T>,
    kinds: TopicKinds,
    publish_topics: TopicRegistry<PublishHandle>,
    subscribe_topics: TopicRegistry<SubscribeHandle>,
    status: ClientStatus,
}

impl<T: Transport> MqttClient<T> {
    pub fn new(transport: T, retry: RetryPolicy) -> Self {
        Self::from_connection(ConnectionManager::new(transport, retry))
    }

    pub fn from_connection(connection: ConnectionManager<T>) -> Self {
        Self {
            connection,
            kinds: TopicKinds::default(),
            publish_topics: TopicRegistry::new(),
            subscribe_topics: TopicRegistry::new(),
            status: ClientStatus::default(),
        }
    }

    pub fn with_kinds(mut self, kinds: TopicKinds) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn kinds(&self) -> &TopicKinds {
        &self.kinds
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn transport(&self) -> &T {
        self.connection.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.connection.transport_mut()
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            connection_state: self.connection.state(),
            connection_attempts: self.connection.handshake_attempts(),
            dropped_messages: self.connection.unmatched_packets(),
            ..self.status.clone()
        }
    }

    pub fn connected(&self) -> bool {
        self.connection.connected()
    }

    pub fn connect(&mut self) -> bool {
        self.connection.connect()
    }

    pub fn disconnect(&mut self) -> bool {
        self.connection.disconnect()
    }

    pub fn publish_topic(&self, name: &str) -> Option<&TopicRecord<PublishHandle>> {
        self.publish_topics.get(name)
    }

    pub fn subscribe_topic(&self, name: &str) -> Option<&TopicRecord<SubscribeHandle>> {
        self.subscribe_topics.get(name)
    }

    pub fn publish_topics(&self) -> impl Iterator<Item = &TopicRecord<PublishHandle>> {
        self.publish_topics.iter()
    }

    pub fn subscribe_topics(&self) -> impl Iterator<Item = &TopicRecord<SubscribeHandle>> {
        self.subscribe_topics.iter()
    }

    /// Registers `name` for publishing on `/{kind prefix}/{fragment}`.
    pub fn create_publish_topic(&mut self, name: &str, fragment: &str, kind: &str) -> bool {
        let path = match self
            .publish_topics
            .check_available(name)
            .and_then(|_| self.kinds.canonical_path(kind, fragment))
        {
            Ok(path) => path,
            Err(e) => {
                error!("createPublishTopic failed for topic '{}' - {}", name, e);
                return false;
            }
        };

        let handle = self.connection.publisher(&path);
        let record = TopicRecord::new(name, path, kind, handle);
        match self.publish_topics.insert(record) {
            Ok(record) => {
                info!(
                    "Created MQTT publish topic '{}' with MQTT path '{}'",
                    record.name(),
                    record.path()
                );
                true
            }
            Err(e) => {
                error!("createPublishTopic failed for topic '{}' - {}", name, e);
                false
            }
        }
    }

    pub fn remove_publish_topic(&mut self, name: &str) -> bool {
        match self.publish_topics.remove(name) {
            Ok(record) => {
                info!("Removed MQTT publish topic '{}' ({})", name, record.path());
                true
            }
            Err(e) => {
                error!("removePublishTopic failed for topic '{}' - {}", name, e);
                false
            }
        }
    }

    /// Registers `name` for receiving on `/{kind prefix}/{fragment}`.
    ///
    /// The subscribe handle joins the connection's subscription set as part of
    /// its creation.
    pub fn create_subscribe_topic(&mut self, name: &str, fragment: &str, kind: &str) -> bool {
        let path = match self
            .subscribe_topics
            .check_available(name)
            .and_then(|_| self.kinds.canonical_path(kind, fragment))
        {
            Ok(path) => path,
            Err(e) => {
                error!("createSubscribeTopic failed for topic '{}' - {}", name, e);
                return false;
            }
        };

        let handle = self.connection.subscribe(&path);
        let record = TopicRecord::new(name, path, kind, handle);
        match self.subscribe_topics.insert(record) {
            Ok(record) => {
                info!(
                    "Created MQTT subscribe topic '{}' with MQTT path '{}'",
                    record.name(),
                    record.path()
                );
                true
            }
            Err(e) => {
                error!("createSubscribeTopic failed for topic '{}' - {}", name, e);
                false
            }
        }
    }

    pub fn remove_subscribe_topic(&mut self, name: &str) -> bool {
        match self.subscribe_topics.remove(name) {
            Ok(record) => {
                info!("Removed MQTT subscribe topic '{}' ({})", name, record.path());
                self.connection.unsubscribe(record.into_handle());
                true
            }
            Err(e) => {
                error!("removeSubscribeTopic failed for topic '{}' - {}", name, e);
                false
            }
        }
    }

    /// Installs the callback of subscribe topic `name`, replacing any previous one.
    pub fn add_notify_callback(&mut self, name: &str, callback: NotifyCallback) -> bool {
        match self.subscribe_topics.set_callback(name, callback) {
            Ok(previous) => {
                if previous.is_some() {
                    debug!("Replaced notify callback of topic '{}'", name);
                }
                true
            }
            Err(e) => {
                error!("addNotifyCallback failed for topic '{}' - {}", name, e);
                false
            }
        }
    }

    pub fn remove_notify_callback(&mut self, name: &str) -> bool {
        match self.subscribe_topics.clear_callback(name) {
            Ok(_) => true,
            Err(e) => {
                error!("removeNotifyCallback failed for topic '{}' - {}", name, e);
                false
            }
        }
    }

    pub fn notify_callback(&self, name: &str) -> Option<NotifyCallback> {
        match self.subscribe_topics.callback(name) {
            Ok(callback) => Some(callback),
            Err(e) => {
                error!("notifyCallback failed for topic '{}' - {}", name, e);
                None
            }
        }
    }

    /// Publishes `message` on the topic registered as `name`.
    ///
    /// The message is sent once or dropped; nothing is queued for later.
    pub fn publish(&mut self, name: &str, message: &str) -> bool {
        if !self.connection.connect() {
            error!("publish failed for topic '{}' - connection failed!", name);
            return false;
        }
        let Some(record) = self.publish_topics.get(name) else {
            error!(
                "publish failed for topic '{}' - {}",
                name,
                TopicError::UnknownTopic(name.to_string())
            );
            return false;
        };
        if !record.handle().is_bound_to(record.path()) {
            error!(
                "publish failed for topic '{}' - invalid publish handle object!",
                name
            );
            return false;
        }
        if let Err(e) = self.connection.send(record.handle(), message) {
            error!(
                "publish failed for topic '{}' - error on sending message '{}': {}",
                name, message, e
            );
            self.status.failed_sends += 1;
            return false;
        }

        debug!("Published '{}' on '{}'", message, record.path());
        self.status.messages_sent += 1;
        self.status.last_activity = Some(Local::now());
        true
    }

    /// Processes at most one inbound message, waiting up to `timeout` for it.
    ///
    /// Returns `true` when a message was dispatched to a subscribe topic.
    pub fn wait_for_messages(&mut self, timeout: Duration) -> bool {
        if !self.connection.connect() {
            error!("waitForMessages failed - connection failed!");
            return false;
        }
        let Some(delivery) = self.connection.read_subscription(timeout) else {
            return false;
        };

        // subscribe handles only live inside subscribe records, so every
        // delivered handle has an owner
        let Some(name) = self
            .subscribe_topics
            .iter()
            .find(|record| record.handle().id() == delivery.handle)
            .map(|record| record.name().to_string())
        else {
            return false;
        };

        self.dispatch(&name, &delivery);
        true
    }

    /// Echoes the decoded switch state and notifies the topic's callback.
    fn dispatch(&mut self, name: &str, delivery: &Delivery) {
        let message = InboundMessage::from_payload(name, &delivery.path, &delivery.payload);
        info!("MQTT message arrived [{}]", message);
        trace!("{}", message.render());
        self.status.messages_received += 1;
        self.status.last_activity = Some(Local::now());

        let enabled = message.enabled();

        if let Some(record) = self.publish_topics.get(name) {
            let echo = state_message(enabled);
            match self.connection.send(record.handle(), echo) {
                Ok(()) => {
                    debug!("Echoed '{}' on '{}'", echo, record.path());
                    self.status.messages_sent += 1;
                }
                Err(e) => {
                    warn!("Echo for topic '{}' failed: {}", name, e);
                    self.status.failed_sends += 1;
                }
            }
        }

        if let Some(callback) = self
            .subscribe_topics
            .get(name)
            .and_then(|record| record.callback())
            .cloned()
        {
            callback(message.topic(), message.content());
        }

        info!(
            "switch '{}' set to {}",
            name,
            if enabled { "ON" } else { "OFF" }
        );
    }
}

impl<T: Transport> Drop for MqttClient<T> {
    fn drop(&mut self) {
        for record in self.subscribe_topics.take_all() {
            self.connection.unsubscribe(record.into_handle());
        }
    }
}
