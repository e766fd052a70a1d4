//! In-memory [`Transport`] for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::transport::{InboundPacket, Transport, TransportError};

/// Records every call and replays scripted handshake results and inbound packets.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    /// Results for the next handshakes; an empty script means success
    pub handshake_script: VecDeque<Result<(), TransportError>>,
    /// Refuse every handshake regardless of the script
    pub refuse_all: bool,
    pub fail_sends: bool,
    pub connected: bool,
    pub handshakes: usize,
    pub closes: usize,
    pub sent: Vec<(String, String)>,
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    /// Copy of `unsubscribed` that stays readable after the transport is dropped
    pub unsubscribe_log: Arc<Mutex<Vec<String>>>,
    pub inbound: VecDeque<InboundPacket>,
    pub polls: usize,
}

impl ScriptedTransport {
    pub fn refusing() -> Self {
        Self {
            refuse_all: true,
            ..Self::default()
        }
    }

    pub fn fail_handshakes(&mut self, count: usize) {
        for _ in 0..count {
            self.handshake_script
                .push_back(Err(TransportError::Refused("server unavailable".to_string())));
        }
    }

    pub fn drop_link(&mut self) {
        self.connected = false;
    }

    pub fn push_inbound(&mut self, packet: InboundPacket) {
        self.inbound.push_back(packet);
    }

    /// Messages sent on `path`, in order.
    pub fn sent_on(&self, path: &str) -> Vec<&str> {
        self.sent
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, m)| m.as_str())
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn handshake(&mut self) -> Result<(), TransportError> {
        self.handshakes += 1;
        if self.refuse_all {
            return Err(TransportError::Refused("not authorized".to_string()));
        }
        let result = self.handshake_script.pop_front().unwrap_or(Ok(()));
        self.connected = result.is_ok();
        result
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closes += 1;
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, path: &str, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.fail_sends {
            return Err(TransportError::SendTimeout(Duration::from_millis(1)));
        }
        self.sent
            .push((path.to_string(), String::from_utf8_lossy(payload).into_owned()));
        Ok(())
    }

    fn subscribe(&mut self, path: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.subscribed.push(path.to_string());
        Ok(())
    }

    fn unsubscribe(&mut self, path: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.unsubscribed.push(path.to_string());
        if let Ok(mut log) = self.unsubscribe_log.lock() {
            log.push(path.to_string());
        }
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) -> Result<Option<InboundPacket>, TransportError> {
        self.polls += 1;
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(self.inbound.pop_front())
    }
}
