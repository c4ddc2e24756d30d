//! Inter-node RPC frames.
//!
//! Cluster frames travel over the same length-prefixed MessagePack codec as
//! client frames. The `payload` is an opaque MessagePack document whose type
//! depends on `action`; responses echo the request's `correlation_id`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::codec::ProtocolError;

/// What a cluster frame asks the destination node to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAction {
    /// Deliver a client envelope to the topic's authoritative actor.
    Route,
    /// Broadcast from an authoritative topic to a proxying node.
    Relay,
    /// Make sure the topic is loaded and live on the destination.
    Load,
    /// Health probe.
    Ping,
}

/// Direction of a cluster frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterFrameKind {
    Request,
    Response,
}

/// A frame exchanged between cluster nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterFrame {
    /// Correlates a response with its request.
    pub correlation_id: u64,
    /// Sending node.
    pub source_node: String,
    /// Receiving node.
    pub dest_node: String,
    /// Request or response.
    pub kind: ClusterFrameKind,
    /// Requested operation.
    pub action: ClusterAction,
    /// Topic concerned (empty for pings).
    pub topic: String,
    /// MessagePack-encoded body.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ClusterFrame {
    /// Build a request frame.
    #[must_use]
    pub fn request(
        correlation_id: u64,
        source_node: impl Into<String>,
        dest_node: impl Into<String>,
        action: ClusterAction,
        topic: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            correlation_id,
            source_node: source_node.into(),
            dest_node: dest_node.into(),
            kind: ClusterFrameKind::Request,
            action,
            topic: topic.into(),
            payload,
        }
    }

    /// Build the response to this request, swapping source and destination.
    #[must_use]
    pub fn respond(&self, payload: Vec<u8>) -> Self {
        Self {
            correlation_id: self.correlation_id,
            source_node: self.dest_node.clone(),
            dest_node: self.source_node.clone(),
            kind: ClusterFrameKind::Response,
            action: self.action,
            topic: self.topic.clone(),
            payload,
        }
    }

    /// Whether this frame is a request.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.kind == ClusterFrameKind::Request
    }

    /// Decode the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid `T`.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }
}

/// Encode a payload body for a cluster frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_echoes_correlation() {
        let request = ClusterFrame::request(42, "n2", "n1", ClusterAction::Route, "grp1", vec![]);
        assert!(request.is_request());

        let response = request.respond(vec![1, 2, 3]);
        assert_eq!(response.correlation_id, 42);
        assert_eq!(response.source_node, "n1");
        assert_eq!(response.dest_node, "n2");
        assert_eq!(response.kind, ClusterFrameKind::Response);
        assert_eq!(response.action, ClusterAction::Route);
        assert_eq!(response.topic, "grp1");
    }

    #[test]
    fn test_body_decoding() {
        let payload = encode_body(&("grp1".to_string(), 7u64)).unwrap();
        let frame = ClusterFrame::request(1, "n1", "n2", ClusterAction::Load, "grp1", payload);
        let (topic, seq): (String, u64) = frame.body().unwrap();
        assert_eq!(topic, "grp1");
        assert_eq!(seq, 7);

        let bad = ClusterFrame::request(2, "n1", "n2", ClusterAction::Load, "grp1", vec![0xc1]);
        assert!(bad.body::<u64>().is_err());
    }
}
