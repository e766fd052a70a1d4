//! Broker transport seam.
//!
//! [`Transport`] is the only place where bytes leave or enter the node. The
//! connection manager drives it synchronously: handshake, send, subscribe and a
//! bounded poll for inbound publishes. [`RumqttTransport`] implements it on top
//! of the blocking `rumqttc` client, any other link (or a scripted one in tests)
//! only has to provide the same seven calls.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet,
    QoS, RecvTimeoutError,
};
use tracing::{debug, trace, warn};

use super::config::BrokerConfig;

/// Capacity of the request queue between `rumqttc::Client` and its event loop.
const REQUEST_CAPACITY: usize = 32;

/// Errors raised by a [`Transport`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Broker answered the handshake with a refusal
    #[error("broker refused connection: {0}")]
    Refused(String),

    /// No CONNACK arrived in time
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// A queued request was not flushed to the socket in time
    #[error("request not flushed within {0:?}")]
    SendTimeout(Duration),

    #[error("not connected to broker")]
    NotConnected,

    /// The event loop went away underneath us
    #[error("transport closed")]
    Closed,

    #[error("client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// A publish received from the broker, before it is attributed to a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundPacket {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Stream-like link to one broker.
///
/// Every call is blocking and bounded. Implementations keep their own notion of
/// liveness in [`Transport::is_connected`], which must never block.
pub trait Transport: Send {
    /// Performs one broker handshake attempt.
    fn handshake(&mut self) -> Result<(), TransportError>;

    /// Tears down the session, including partial state after a failed handshake.
    fn close(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Sends `payload` on `path` with at-most-once delivery.
    fn send(&mut self, path: &str, payload: &[u8]) -> Result<(), TransportError>;

    fn subscribe(&mut self, path: &str) -> Result<(), TransportError>;

    fn unsubscribe(&mut self, path: &str) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the next inbound publish.
    ///
    /// `Ok(None)` means nothing arrived within `timeout`.
    fn poll(&mut self, timeout: Duration) -> Result<Option<InboundPacket>, TransportError>;
}

struct Session {
    client: Client,
    connection: Connection,
}

/// [`Transport`] backed by the blocking `rumqttc` client.
///
/// A fresh client/event-loop pair is built for every handshake so that a dead
/// session never reconnects on its own; reconnection stays with the caller.
pub struct RumqttTransport {
    options: MqttOptions,
    handshake_timeout: Duration,
    send_timeout: Duration,
    session: Option<Session>,
    pending: VecDeque<InboundPacket>,
}

impl RumqttTransport {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            options: config.mqtt_options(),
            handshake_timeout: config.handshake_timeout(),
            send_timeout: config.send_timeout(),
            session: None,
            pending: VecDeque::new(),
        }
    }

    /// Polls the event loop until `done` matches an outgoing event.
    ///
    /// Publishes that arrive meanwhile are buffered for the next [`Transport::poll`].
    fn drive_until(
        &mut self,
        timeout: Duration,
        done: impl Fn(&Outgoing) -> bool,
    ) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
            match session.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Outgoing(outgoing))) if done(&outgoing) => return Ok(()),
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    self.pending
                        .push_back(InboundPacket::new(publish.topic, publish.payload.to_vec()));
                }
                Ok(Ok(event)) => trace!("MQTT event while flushing: {:?}", event),
                Ok(Err(e)) => {
                    self.session = None;
                    return Err(e.into());
                }
                Err(RecvTimeoutError::Timeout) => return Err(TransportError::SendTimeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    self.session = None;
                    return Err(TransportError::Closed);
                }
            }
        }
    }
}

fn refusal_reason(code: ConnectReturnCode) -> String {
    match code {
        ConnectReturnCode::BadUserNamePassword => "bad user name or password".to_string(),
        ConnectReturnCode::NotAuthorized => "not authorized".to_string(),
        ConnectReturnCode::ServiceUnavailable => "server unavailable".to_string(),
        other => format!("{:?}", other),
    }
}

impl Transport for RumqttTransport {
    fn handshake(&mut self) -> Result<(), TransportError> {
        self.session = None;
        let (client, mut connection) = Client::new(self.options.clone(), REQUEST_CAPACITY);
        let deadline = Instant::now() + self.handshake_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Refused(refusal_reason(ack.code)));
                    }
                    debug!("CONNACK received (session present: {})", ack.session_present);
                    self.session = Some(Session { client, connection });
                    return Ok(());
                }
                Ok(Ok(event)) => trace!("MQTT event during handshake: {:?}", event),
                Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                    return Err(TransportError::Refused(refusal_reason(code)));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(TransportError::HandshakeTimeout(self.handshake_timeout));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            }
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if let Err(e) = session.client.disconnect() {
            self.session = None;
            return Err(e.into());
        }
        let result = self.drive_until(self.send_timeout, |out| {
            matches!(out, Outgoing::Disconnect)
        });
        self.session = None;
        result
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn send(&mut self, path: &str, payload: &[u8]) -> Result<(), TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        session
            .client
            .publish(path, QoS::AtMostOnce, false, payload.to_vec())?;
        self.drive_until(self.send_timeout, |out| matches!(out, Outgoing::Publish(_)))
    }

    fn subscribe(&mut self, path: &str) -> Result<(), TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        session.client.subscribe(path, QoS::AtMostOnce)?;
        self.drive_until(self.send_timeout, |out| {
            matches!(out, Outgoing::Subscribe(_))
        })
    }

    fn unsubscribe(&mut self, path: &str) -> Result<(), TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        session.client.unsubscribe(path)?;
        self.drive_until(self.send_timeout, |out| {
            matches!(out, Outgoing::Unsubscribe(_))
        })
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<InboundPacket>, TransportError> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(Some(packet));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
            match session.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    return Ok(Some(InboundPacket::new(
                        publish.topic,
                        publish.payload.to_vec(),
                    )));
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    warn!("Disconnected by broker");
                    self.session = None;
                    return Err(TransportError::Closed);
                }
                Ok(Ok(event)) => trace!("MQTT event while polling: {:?}", event),
                Ok(Err(e)) => {
                    self.session = None;
                    return Err(e.into());
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    self.session = None;
                    return Err(TransportError::Closed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_transport_is_disconnected() {
        let mut transport = RumqttTransport::new(&BrokerConfig::default());
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send("/sensor/a", b"1"),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.poll(Duration::from_millis(1)),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn close_without_session_is_ok() {
        let mut transport = RumqttTransport::new(&BrokerConfig::default());
        assert!(transport.close().is_ok());
    }

    #[test]
    fn refusal_reasons_are_readable() {
        assert_eq!(
            refusal_reason(ConnectReturnCode::BadUserNamePassword),
            "bad user name or password"
        );
        assert_eq!(refusal_reason(ConnectReturnCode::NotAuthorized), "not authorized");
    }
}
