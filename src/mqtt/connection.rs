//! Connection manager for the broker link.
//!
//! Owns the [`Transport`], the retry budget and the set of live subscriptions.
//! Reconnection is always lazy: nothing happens in the background, the next
//! caller of [`ConnectionManager::connect`] discovers a dead link and retries.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──handshake ok──► Connected
//!      ▲                          │                           │
//!      └──── retries exhausted ───┘                           │
//!      └──────────── disconnect() / link lost ────────────────┘
//! ```
//!
//! # Handles
//!
//! Every registered topic owns one handle bound to its broker path.
//! [`PublishHandle`]s are plain tickets for [`ConnectionManager::send`].
//! [`SubscribeHandle`]s are members of the subscription set for as long as they
//! live: [`ConnectionManager::subscribe`] inserts them, dropping them removes
//! them, so the set cannot drift from the handles that exist.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::config::RetryPolicy;
use super::transport::{Transport, TransportError};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Identity of a protocol handle, unique per connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u32);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Common view on publish and subscribe handles.
pub trait TopicHandle {
    fn id(&self) -> HandleId;

    /// Broker path the handle is bound to.
    fn path(&self) -> &str;

    fn is_bound_to(&self, path: &str) -> bool {
        !self.path().is_empty() && self.path() == path
    }
}

#[derive(Debug)]
pub struct PublishHandle {
    id: HandleId,
    path: String,
}

impl TopicHandle for PublishHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn path(&self) -> &str {
        &self.path
    }
}

type SubscriptionTable = Mutex<BTreeMap<HandleId, String>>;

fn lock_table(table: &SubscriptionTable) -> MutexGuard<'_, BTreeMap<HandleId, String>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live member of the subscription set.
///
/// Only [`ConnectionManager::subscribe`] creates one; dropping it removes its
/// entry from the set.
#[derive(Debug)]
pub struct SubscribeHandle {
    id: HandleId,
    path: String,
    table: Weak<SubscriptionTable>,
}

impl TopicHandle for SubscribeHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for SubscribeHandle {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            lock_table(&table).remove(&self.id);
        }
    }
}

/// An inbound publish attributed to a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub handle: HandleId,
    pub path: String,
    pub payload: Vec<u8>,
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    retry: RetryPolicy,
    state: ConnectionState,
    subscriptions: Arc<SubscriptionTable>,
    next_handle: u32,
    pause: Box<dyn FnMut(Duration) + Send>,
    handshake_attempts: u64,
    unmatched_packets: u64,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            state: ConnectionState::Disconnected,
            subscriptions: Arc::new(Mutex::new(BTreeMap::new())),
            next_handle: 0,
            pause: Box::new(std::thread::sleep),
            handshake_attempts: 0,
            unmatched_packets: 0,
        }
    }

    /// Replaces the blocking sleep used between handshake attempts.
    ///
    /// Hosts with a cooperative scheduler hand in their yield here.
    pub fn with_pause(mut self, pause: impl FnMut(Duration) + Send + 'static) -> Self {
        self.pause = Box::new(pause);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Total handshakes tried over the lifetime of this manager.
    pub fn handshake_attempts(&self) -> u64 {
        self.handshake_attempts
    }

    /// Inbound packets whose path matched no live subscription.
    pub fn unmatched_packets(&self) -> u64 {
        self.unmatched_packets
    }

    pub fn connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport.is_connected()
    }

    /// Connects to the broker unless already connected.
    ///
    /// Makes at most `retry.attempts` handshakes with a fixed pause between
    /// failures. Returns the resulting connectivity; exhausting the budget is
    /// not an error.
    pub fn connect(&mut self) -> bool {
        if self.connected() {
            return true;
        }
        if self.state == ConnectionState::Connected {
            warn!("MQTT connection lost, reconnecting");
        }

        let attempts = self.retry.attempts;
        info!(
            "Connecting to MQTT ({} attempt(s), at most {:?} of pauses)...",
            attempts,
            self.retry.worst_case_pause()
        );
        self.state = ConnectionState::Connecting;

        for attempt in 1..=attempts {
            self.handshake_attempts += 1;
            match self.transport.handshake() {
                Ok(()) => break,
                Err(e) => {
                    warn!("MQTT handshake {}/{} failed: {}", attempt, attempts, e);
                    if let Err(e) = self.transport.close() {
                        debug!("Tearing down failed handshake: {}", e);
                    }
                    if attempt == attempts {
                        break;
                    }
                    info!("Retrying MQTT connection in {:?}", self.retry.delay());
                    (self.pause)(self.retry.delay());
                }
            }
        }

        if self.transport.is_connected() {
            self.state = ConnectionState::Connected;
            info!("MQTT connected successfully");
            self.resubscribe_all();
            true
        } else {
            self.state = ConnectionState::Disconnected;
            error!("MQTT connection failed!");
            false
        }
    }

    /// Closes the broker session. Not being connected counts as success.
    pub fn disconnect(&mut self) -> bool {
        if !self.connected() {
            self.state = ConnectionState::Disconnected;
            return true;
        }
        let result = self.transport.close();
        self.state = ConnectionState::Disconnected;
        match result {
            Ok(()) => {
                info!("MQTT disconnected");
                true
            }
            Err(e) => {
                warn!("MQTT disconnect failed: {}", e);
                false
            }
        }
    }

    fn allocate_id(&mut self) -> HandleId {
        self.next_handle = self.next_handle.wrapping_add(1);
        HandleId(self.next_handle)
    }

    /// Creates a publish handle bound to `path`.
    pub fn publisher(&mut self, path: &str) -> PublishHandle {
        PublishHandle {
            id: self.allocate_id(),
            path: path.to_string(),
        }
    }

    /// Creates a subscribe handle bound to `path` and adds it to the
    /// subscription set in the same step.
    ///
    /// While connected the broker subscription is sent right away, otherwise it
    /// follows with the next successful handshake.
    pub fn subscribe(&mut self, path: &str) -> SubscribeHandle {
        let handle = SubscribeHandle {
            id: self.allocate_id(),
            path: path.to_string(),
            table: Arc::downgrade(&self.subscriptions),
        };
        let first_on_path = {
            let mut table = lock_table(&self.subscriptions);
            let shared = table.values().any(|p| p == path);
            table.insert(handle.id, handle.path.clone());
            !shared
        };

        if first_on_path && self.connected() {
            if let Err(e) = self.transport.subscribe(path) {
                warn!("Broker subscription for '{}' failed: {}", path, e);
            }
        }
        handle
    }

    /// Leaves the subscription set, then releases the handle.
    ///
    /// The broker subscription is only dropped with the last handle on its path.
    pub fn unsubscribe(&mut self, handle: SubscribeHandle) {
        let last_on_path = {
            let mut table = lock_table(&self.subscriptions);
            table.remove(&handle.id);
            !table.values().any(|p| *p == handle.path)
        };

        if last_on_path && self.connected() {
            if let Err(e) = self.transport.unsubscribe(&handle.path) {
                warn!("Broker unsubscribe for '{}' failed: {}", handle.path, e);
            }
        }
        drop(handle);
    }

    pub fn is_subscribed(&self, id: HandleId) -> bool {
        lock_table(&self.subscriptions).contains_key(&id)
    }

    pub fn subscription_count(&self) -> usize {
        lock_table(&self.subscriptions).len()
    }

    fn resubscribe_all(&mut self) {
        let paths: BTreeSet<String> = lock_table(&self.subscriptions).values().cloned().collect();
        for path in paths {
            match self.transport.subscribe(&path) {
                Ok(()) => debug!("Subscribed to '{}'", path),
                Err(e) => warn!("Broker subscription for '{}' failed: {}", path, e),
            }
        }
    }

    fn note_link_state(&mut self) {
        if !self.transport.is_connected() && self.state == ConnectionState::Connected {
            warn!("MQTT link dropped");
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Sends `message` through `handle`. Delivery is at most once.
    pub fn send(&mut self, handle: &PublishHandle, message: &str) -> Result<(), TransportError> {
        let result = self.transport.send(&handle.path, message.as_bytes());
        self.note_link_state();
        result
    }

    /// Waits up to `timeout` for a publish on any live subscription.
    ///
    /// Packets for paths outside the subscription set are dropped and the wait
    /// continues. Returns `None` on timeout or transport failure.
    pub fn read_subscription(&mut self, timeout: Duration) -> Option<Delivery> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let packet = match self.transport.poll(remaining) {
                Ok(Some(packet)) => packet,
                Ok(None) => return None,
                Err(e) => {
                    warn!("Reading MQTT subscriptions failed: {}", e);
                    self.note_link_state();
                    return None;
                }
            };

            let handle = lock_table(&self.subscriptions)
                .iter()
                .find(|(_, path)| **path == packet.topic)
                .map(|(id, _)| *id);

            match handle {
                Some(handle) => {
                    return Some(Delivery {
                        handle,
                        path: packet.topic,
                        payload: packet.payload,
                    });
                }
                None => {
                    self.unmatched_packets += 1;
                    debug!("Dropping packet for unsubscribed path '{}'", packet.topic);
                    if remaining.is_zero() {
                        return None;
                    }
                }
            }
        }
    }
}
