//! Cluster membership, topic ownership and inter-node RPC.
//!
//! Ownership of a topic is decided by a consistent-hash ring over the nodes
//! currently considered alive. The ring lives in an immutable [`Membership`]
//! snapshot published through a `watch` channel; health checks replace the
//! snapshot whenever a node changes state, and the hub migrates topics in
//! response.

mod link;
mod ring;
pub mod tcp;

pub use link::{ClusterLink, ClusterService, LinkError, MemoryNetwork};
pub use ring::HashRing;

use courier_protocol::cluster::encode_body;
use courier_protocol::{ClusterAction, ClusterFrame, Frame};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::CourierError;
use crate::message::{Envelope, RouteResult};

/// Capacity of each per-node relay queue.
const RELAY_QUEUE: usize = 4096;

/// One node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub name: String,
    /// Cluster listener address (`host:port`).
    pub address: String,
}

/// Cluster settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Name of this node.
    pub node: String,
    /// Every node of the cluster, this one included.
    pub nodes: Vec<NodeConfig>,
    /// Virtual points per node on the hash ring.
    pub replicas: usize,
    /// Timeout of one RPC attempt.
    pub rpc_timeout: Duration,
    /// Additional attempts after a failed forward.
    pub rpc_retries: u32,
    /// Backoff before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
    /// Period of health pings.
    pub health_interval: Duration,
    /// Consecutive failed pings before a node is Suspect.
    pub suspect_after: u32,
    /// Consecutive failed pings before a node is Down.
    pub down_after: u32,
}

impl ClusterConfig {
    /// Configuration of a node running alone.
    #[must_use]
    pub fn standalone(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            nodes: Vec::new(),
            ..Self::default()
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node: "node1".to_string(),
            nodes: Vec::new(),
            replicas: 20,
            rpc_timeout: Duration::from_secs(3),
            rpc_retries: 2,
            retry_backoff: Duration::from_millis(100),
            health_interval: Duration::from_secs(2),
            suspect_after: 3,
            down_after: 4,
        }
    }
}

/// Health of a cluster node as seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeHealth {
    Up,
    Suspect,
    Down,
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeHealth::Up => "up",
            NodeHealth::Suspect => "suspect",
            NodeHealth::Down => "down",
        })
    }
}

/// Immutable view of the cluster.
#[derive(Debug, Clone)]
pub struct Membership {
    version: u64,
    nodes: BTreeMap<String, NodeHealth>,
    ring: HashRing,
}

impl Membership {
    fn new(version: u64, nodes: BTreeMap<String, NodeHealth>, replicas: usize) -> Self {
        let ring = HashRing::new(
            nodes
                .iter()
                .filter(|(_, health)| **health != NodeHealth::Down)
                .map(|(name, _)| name.as_str()),
            replicas,
        );
        Self {
            version,
            nodes,
            ring,
        }
    }

    /// Increases with every change.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Health of a node.
    #[must_use]
    pub fn health(&self, node: &str) -> Option<NodeHealth> {
        self.nodes.get(node).copied()
    }

    /// Owner of a topic according to this snapshot.
    #[must_use]
    pub fn owner(&self, topic: &str) -> Option<&str> {
        self.ring.owner(topic)
    }

    /// Nodes currently Down.
    #[must_use]
    pub fn down_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, health)| **health == NodeHealth::Down)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every known node with its health.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, NodeHealth)> {
        self.nodes.iter().map(|(n, h)| (n.as_str(), *h))
    }
}

/// This node's membership in the cluster.
pub struct Cluster {
    node: String,
    config: ClusterConfig,
    links: HashMap<String, Arc<dyn ClusterLink>>,
    membership: watch::Sender<Arc<Membership>>,
    failures: DashMap<String, u32>,
    relays: DashMap<String, mpsc::Sender<ClusterFrame>>,
    next_correlation: AtomicU64,
    shutdown: CancellationToken,
}

impl Cluster {
    /// Create the cluster view of `config.node` with links to its peers.
    ///
    /// Every peer starts Up.
    #[must_use]
    pub fn new(config: ClusterConfig, links: HashMap<String, Arc<dyn ClusterLink>>) -> Self {
        let mut nodes: BTreeMap<String, NodeHealth> = config
            .nodes
            .iter()
            .map(|n| (n.name.clone(), NodeHealth::Up))
            .collect();
        nodes.insert(config.node.clone(), NodeHealth::Up);
        for peer in links.keys() {
            nodes.entry(peer.clone()).or_insert(NodeHealth::Up);
        }

        let (membership, _) = watch::channel(Arc::new(Membership::new(1, nodes, config.replicas)));
        info!(
            node = %config.node,
            peers = links.len(),
            replicas = config.replicas,
            "Cluster membership initialised"
        );

        Self {
            node: config.node.clone(),
            config,
            links,
            membership,
            failures: DashMap::new(),
            relays: DashMap::new(),
            next_correlation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// A cluster of one.
    #[must_use]
    pub fn standalone(node: impl Into<String>) -> Self {
        Self::new(ClusterConfig::standalone(node), HashMap::new())
    }

    /// Name of this node.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Cluster settings.
    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Names of the peers this node has links to.
    #[must_use]
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.links.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Current membership snapshot.
    #[must_use]
    pub fn membership(&self) -> Arc<Membership> {
        self.membership.borrow().clone()
    }

    /// Receiver notified on every membership change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<Membership>> {
        self.membership.subscribe()
    }

    /// Node owning `topic`.
    #[must_use]
    pub fn resolve_owner(&self, topic: &str) -> String {
        self.membership()
            .owner(topic)
            .map_or_else(|| self.node.clone(), str::to_string)
    }

    /// Whether this node owns `topic`.
    #[must_use]
    pub fn is_local(&self, topic: &str) -> bool {
        self.resolve_owner(topic) == self.node
    }

    /// Override the health of a node and publish the change.
    pub fn set_node_health(&self, node: &str, health: NodeHealth) {
        if node == self.node {
            return;
        }
        let changed = self.membership.send_if_modified(|current| {
            if current.health(node) == Some(health) {
                return false;
            }
            let mut nodes = current.nodes.clone();
            nodes.insert(node.to_string(), health);
            *current = Arc::new(Membership::new(
                current.version + 1,
                nodes,
                self.config.replicas,
            ));
            true
        });
        if changed {
            info!(node = %node, %health, "Node health changed");
        }
    }

    fn next_correlation(&self) -> u64 {
        self.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// One RPC attempt with the configured timeout.
    async fn call(
        &self,
        node: &str,
        action: ClusterAction,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<ClusterFrame, CourierError> {
        let link = self
            .links
            .get(node)
            .ok_or_else(|| CourierError::ClusterUnreachable(format!("no link to {node}")))?;
        let frame = ClusterFrame::request(
            self.next_correlation(),
            self.node.as_str(),
            node,
            action,
            topic,
            payload,
        );
        match tokio::time::timeout(self.config.rpc_timeout, link.call(frame)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(CourierError::ClusterUnreachable(err.to_string())),
            Err(_) => Err(CourierError::ClusterUnreachable(format!(
                "{node} did not answer within {:?}",
                self.config.rpc_timeout
            ))),
        }
    }

    /// Forward an envelope to the owning node and return its reply.
    ///
    /// Transport failures are retried with exponential backoff; errors
    /// returned by the owner are final.
    pub async fn forward(&self, envelope: &Envelope, owner: &str) -> RouteResult {
        let payload = encode_body(envelope)?;
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            match self
                .call(owner, ClusterAction::Route, &envelope.topic, payload.clone())
                .await
            {
                Ok(response) => return response.body::<RouteResult>()?,
                Err(err) if attempt < self.config.rpc_retries => {
                    attempt += 1;
                    debug!(
                        node = %owner,
                        topic = %envelope.topic,
                        attempt,
                        error = %err,
                        "Forward failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => {
                    warn!(node = %owner, topic = %envelope.topic, error = %err, "Forward failed");
                    return Err(err);
                }
            }
        }
    }

    /// Ask `node` to load `topic` and wait until it is live there.
    ///
    /// # Errors
    ///
    /// Returns the owner's error or `ClusterUnreachable`.
    pub async fn load(&self, node: &str, topic: &str) -> Result<(), CourierError> {
        let response = self.call(node, ClusterAction::Load, topic, Vec::new()).await?;
        response.body::<Result<(), CourierError>>()?
    }

    /// Probe a node.
    pub async fn ping(&self, node: &str) -> bool {
        self.call(node, ClusterAction::Ping, "", Vec::new())
            .await
            .is_ok()
    }

    /// Queue a broadcast for the sessions proxied on `node`.
    ///
    /// Relays to one node are delivered in the order they were queued.
    pub fn relay(&self, node: &str, topic: &str, frame: Arc<Frame>) {
        let payload = match encode_body(frame.as_ref()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(topic = %topic, error = %err, "Failed to encode relay");
                return;
            }
        };
        let request = ClusterFrame::request(
            self.next_correlation(),
            self.node.as_str(),
            node,
            ClusterAction::Relay,
            topic,
            payload,
        );

        let queue = self
            .relays
            .entry(node.to_string())
            .or_insert_with(|| self.spawn_relay_worker(node))
            .clone();
        if let Err(err) = queue.try_send(request) {
            warn!(node = %node, topic = %topic, error = %err, "Relay queue rejected broadcast");
        }
    }

    fn spawn_relay_worker(&self, node: &str) -> mpsc::Sender<ClusterFrame> {
        let (sender, mut queue) = mpsc::channel::<ClusterFrame>(RELAY_QUEUE);
        let link = self.links.get(node).cloned();
        let timeout = self.config.rpc_timeout;
        let shutdown = self.shutdown.clone();
        let node = node.to_string();

        tokio::spawn(async move {
            let Some(link) = link else {
                warn!(node = %node, "No link for relays");
                return;
            };
            loop {
                let frame = tokio::select! {
                    () = shutdown.cancelled() => break,
                    frame = queue.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let topic = frame.topic.clone();
                match tokio::time::timeout(timeout, link.call(frame)).await {
                    Ok(Ok(_)) => trace!(node = %node, topic = %topic, "Relayed"),
                    Ok(Err(err)) => debug!(node = %node, topic = %topic, error = %err, "Relay failed"),
                    Err(_) => debug!(node = %node, topic = %topic, "Relay timed out"),
                }
            }
        });
        sender
    }

    /// Ping every peer once and update their health.
    pub async fn check_health(&self) {
        let probes = self.links.keys().map(|peer| async move {
            let ok = self.ping(peer).await;
            (peer.clone(), ok)
        });
        for (peer, ok) in futures_util::future::join_all(probes).await {
            let health = if ok {
                self.failures.remove(&peer);
                NodeHealth::Up
            } else {
                let mut failures = self.failures.entry(peer.clone()).or_insert(0);
                *failures += 1;
                let count = *failures;
                drop(failures);
                trace!(node = %peer, failures = count, "Ping failed");
                if count >= self.config.down_after {
                    NodeHealth::Down
                } else if count >= self.config.suspect_after {
                    NodeHealth::Suspect
                } else {
                    continue;
                }
            };
            self.set_node_health(&peer, health);
        }
    }

    /// Run health checks until [`Cluster::shutdown`] is called.
    pub async fn run_health_checks(self: Arc<Self>) {
        if self.links.is_empty() {
            return;
        }
        let mut interval = tokio::time::interval(self.config.health_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.check_health().await,
            }
        }
        debug!(node = %self.node, "Health checks stopped");
    }

    /// Stop relay workers and health checks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Pong;

    #[async_trait]
    impl ClusterService for Pong {
        async fn handle(&self, frame: ClusterFrame) -> ClusterFrame {
            frame.respond(encode_body(&Ok::<(), CourierError>(())).unwrap_or_default())
        }
    }

    fn config(node: &str) -> ClusterConfig {
        ClusterConfig {
            node: node.to_string(),
            nodes: ["n1", "n2", "n3"]
                .iter()
                .map(|n| NodeConfig {
                    name: n.to_string(),
                    address: String::new(),
                })
                .collect(),
            rpc_timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(10),
            ..ClusterConfig::default()
        }
    }

    fn cluster(network: &Arc<MemoryNetwork>) -> Cluster {
        let links = ["n2", "n3"]
            .iter()
            .map(|peer| (peer.to_string(), network.link("n1", peer)))
            .collect();
        Cluster::new(config("n1"), links)
    }

    #[tokio::test]
    async fn test_standalone_owns_everything() {
        let cluster = Cluster::standalone("solo");
        assert!(cluster.is_local("grp1"));
        assert!(cluster.is_local("dm5"));
        assert!(cluster.peers().is_empty());
    }

    #[tokio::test]
    async fn test_down_node_leaves_ring() {
        let network = MemoryNetwork::new();
        let cluster = cluster(&network);

        let owned_by_n2 = (0..100)
            .map(|i| format!("grp{i}"))
            .find(|t| cluster.resolve_owner(t) == "n2")
            .unwrap();

        let mut watcher = cluster.watch();
        cluster.set_node_health("n2", NodeHealth::Suspect);
        assert_eq!(cluster.resolve_owner(&owned_by_n2), "n2");

        cluster.set_node_health("n2", NodeHealth::Down);
        assert!(watcher.has_changed().unwrap());
        assert_ne!(cluster.resolve_owner(&owned_by_n2), "n2");
        assert_eq!(cluster.membership().down_nodes(), vec!["n2".to_string()]);
        assert_eq!(cluster.membership().version(), 3);

        // Unchanged health does not publish a new snapshot.
        let _ = watcher.borrow_and_update();
        cluster.set_node_health("n2", NodeHealth::Down);
        assert!(!watcher.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_health_thresholds() {
        let network = MemoryNetwork::new();
        let n2: Arc<dyn ClusterService> = Arc::new(Pong);
        let n3: Arc<dyn ClusterService> = Arc::new(Pong);
        network.attach("n2", &n2);
        network.attach("n3", &n3);
        let cluster = cluster(&network);

        network.set_reachable("n2", false);
        for _ in 0..2 {
            cluster.check_health().await;
        }
        assert_eq!(cluster.membership().health("n2"), Some(NodeHealth::Up));

        cluster.check_health().await;
        assert_eq!(cluster.membership().health("n2"), Some(NodeHealth::Suspect));

        cluster.check_health().await;
        assert_eq!(cluster.membership().health("n2"), Some(NodeHealth::Down));
        assert_eq!(cluster.membership().health("n3"), Some(NodeHealth::Up));

        network.set_reachable("n2", true);
        cluster.check_health().await;
        assert_eq!(cluster.membership().health("n2"), Some(NodeHealth::Up));
    }

    #[tokio::test]
    async fn test_forward_gives_up_after_retries() {
        let network = MemoryNetwork::new();
        let cluster = cluster(&network);
        let envelope = Envelope::new(
            "grp1",
            crate::session::SessionId::from("n1-1"),
            crate::session::Identity::Anonymous,
            1,
            crate::message::Action::GetInfo,
        );

        let result = cluster.forward(&envelope, "n2").await;
        assert!(matches!(result, Err(CourierError::ClusterUnreachable(_))));
    }
}
