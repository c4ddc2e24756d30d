//! Error taxonomy shared by sessions, topics, the hub and the cluster layer.
//!
//! Errors are plain data so they can be returned across the cluster RPC
//! boundary and rendered into client `error` frames.

use courier_protocol::{Frame, ProtocolError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned to the originator of a request.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CourierError {
    /// Malformed or invalid client request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The requester lacks the access mode the action needs.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Non-creating action against a topic that does not exist.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// The owning node did not answer within the retry budget.
    #[error("Cluster node unreachable: {0}")]
    ClusterUnreachable(String),

    /// The storage collaborator failed; nothing was applied.
    #[error("Store failure: {0}")]
    StoreFailure(String),

    /// The session was evicted or its transport closed.
    #[error("Session evicted: {0}")]
    SessionEvicted(String),

    /// No session with this id.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A configured limit was reached.
    #[error("Limit reached: {0}")]
    LimitReached(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// Numeric code used in client error frames.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            CourierError::Protocol(_) => 400,
            CourierError::PermissionDenied(_) => 403,
            CourierError::TopicNotFound(_) | CourierError::SessionNotFound(_) => 404,
            CourierError::SessionEvicted(_) => 410,
            CourierError::LimitReached(_) => 429,
            CourierError::StoreFailure(_) | CourierError::Internal(_) => 500,
            CourierError::ClusterUnreachable(_) => 503,
        }
    }

    /// Whether the client may retry the same request later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CourierError::ClusterUnreachable(_) | CourierError::StoreFailure(_)
        )
    }

    /// Render as an error frame answering request `id`.
    #[must_use]
    pub fn to_frame(&self, id: u64) -> Frame {
        Frame::error(id, self.code(), self.to_string())
    }
}

impl From<ProtocolError> for CourierError {
    fn from(err: ProtocolError) -> Self {
        CourierError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CourierError::Protocol("bad".into()).code(), 400);
        assert_eq!(CourierError::PermissionDenied("x".into()).code(), 403);
        assert_eq!(CourierError::TopicNotFound("grp".into()).code(), 404);
        assert_eq!(CourierError::ClusterUnreachable("n1".into()).code(), 503);
        assert!(CourierError::ClusterUnreachable("n1".into()).is_retryable());
        assert!(!CourierError::PermissionDenied("x".into()).is_retryable());
    }

    #[test]
    fn test_error_frame() {
        let frame = CourierError::TopicNotFound("grp9".into()).to_frame(12);
        assert_eq!(
            frame,
            Frame::error(12, 404, "Topic not found: grp9".to_string())
        );
    }
}
