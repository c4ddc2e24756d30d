//! Inter-node links.
//!
//! A [`ClusterLink`] carries request frames to one peer and returns its
//! response. The receiving side implements [`ClusterService`].

use async_trait::async_trait;
use courier_protocol::{codec, ClusterFrame};
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Link-level failures.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// The peer cannot be reached.
    #[error("node {0} unreachable")]
    Unreachable(String),

    /// The connection dropped before the response arrived.
    #[error("connection to {0} closed")]
    Closed(String),

    /// The peer sent something undecodable.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<courier_protocol::ProtocolError> for LinkError {
    fn from(err: courier_protocol::ProtocolError) -> Self {
        LinkError::Protocol(err.to_string())
    }
}

/// Outbound request/response channel to one peer.
#[async_trait]
pub trait ClusterLink: Send + Sync + 'static {
    /// Send a request frame and wait for its response.
    async fn call(&self, frame: ClusterFrame) -> Result<ClusterFrame, LinkError>;
}

/// Handles requests arriving from peers.
#[async_trait]
pub trait ClusterService: Send + Sync + 'static {
    /// Process a request frame and produce its response.
    async fn handle(&self, frame: ClusterFrame) -> ClusterFrame;
}

/// In-process network connecting the nodes of a test cluster.
///
/// Frames go through the wire codec on both legs, and nodes can be cut off
/// to simulate failures.
#[derive(Default)]
pub struct MemoryNetwork {
    services: DashMap<String, Weak<dyn ClusterService>>,
    isolated: DashSet<String>,
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach the service answering for `node`.
    pub fn attach(&self, node: &str, service: &Arc<dyn ClusterService>) {
        self.services
            .insert(node.to_string(), Arc::downgrade(service));
    }

    /// Cut a node off (or reconnect it).
    pub fn set_reachable(&self, node: &str, reachable: bool) {
        if reachable {
            self.isolated.remove(node);
        } else {
            self.isolated.insert(node.to_string());
        }
    }

    /// Link from `from` to `to`.
    #[must_use]
    pub fn link(self: &Arc<Self>, from: &str, to: &str) -> Arc<dyn ClusterLink> {
        Arc::new(MemoryLink {
            network: Arc::clone(self),
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    fn service(&self, node: &str) -> Option<Arc<dyn ClusterService>> {
        self.services.get(node).and_then(|s| s.upgrade())
    }
}

struct MemoryLink {
    network: Arc<MemoryNetwork>,
    from: String,
    to: String,
}

#[async_trait]
impl ClusterLink for MemoryLink {
    async fn call(&self, frame: ClusterFrame) -> Result<ClusterFrame, LinkError> {
        let reachable = |n: &str| !self.network.isolated.contains(n);
        if !reachable(&self.from) || !reachable(&self.to) {
            return Err(LinkError::Unreachable(self.to.clone()));
        }
        let service = self
            .network
            .service(&self.to)
            .ok_or_else(|| LinkError::Unreachable(self.to.clone()))?;

        let request: ClusterFrame = codec::decode(&codec::encode(&frame)?)?;
        let response = service.handle(request).await;

        // The peer may have been cut off while handling the request.
        if !reachable(&self.from) || !reachable(&self.to) {
            return Err(LinkError::Closed(self.to.clone()));
        }
        Ok(codec::decode(&codec::encode(&response)?)?)
    }
}
