//! Transport abstraction traits for Courier.
//!
//! These traits define the interface that all transport implementations must provide,
//! allowing the server to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use courier_protocol::Frame;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(format!("conn_{:x}", NEXT.fetch_add(1, Ordering::Relaxed)))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] courier_protocol::ProtocolError),

    /// Message larger than the configured limit.
    #[error("Message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },
}

/// Receiving half of a connection.
#[async_trait]
pub trait FrameReceiver: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// Sending half of a connection.
#[async_trait]
pub trait FrameSender: Send {
    /// Send a frame.
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let data = courier_protocol::codec::encode(frame)?;
        self.send_raw(data).await
    }

    /// Send an already encoded frame.
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An active client connection.
///
/// Connections handle the bidirectional flow of frames between the server
/// and a single client.
#[async_trait]
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Transport name (e.g., "websocket").
    fn name(&self) -> &'static str;

    /// Whether clients of this transport routinely drop and re-establish
    /// the connection between requests (long-poll style).
    fn reconnect_prone(&self) -> bool {
        false
    }

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Receive the next frame from the connection.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Send a frame to the connection.
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Split into independently usable halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }
}
