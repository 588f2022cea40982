//! Duplex transport seam.
//!
//! The relay and the client exchange opaque frame bytes. Delivery order per
//! sender is preserved; nothing else is assumed.

use std::collections::VecDeque;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Outgoing half of a client connection.
pub trait Transport {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;
}

/// In-memory transport that queues outgoing frames until drained.
#[derive(Debug, Default)]
pub struct QueueTransport {
    outbox: VecDeque<Vec<u8>>,
    failing: bool,
    closed: bool,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail until cleared.
    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Take every queued frame, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.outbox.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.outbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty()
    }
}

impl Transport for QueueTransport {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.failing {
            return Err(TransportError::SendFailed("injected failure".to_string()));
        }
        self.outbox.push_back(bytes);
        Ok(())
    }
}
