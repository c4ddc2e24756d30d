//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`courier.toml`, or the `COURIER_CONFIG` path)
//! - Environment variables (`COURIER__PORT`, `COURIER__SESSIONS__IDLE_TIMEOUT_MS`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenvis_courier_core::{ClusterConfig, HubConfig, NodeConfig, SessionConfig, TopicConfig};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Cluster membership of this node.
    #[serde(default)]
    pub cluster: ClusterSection,

    /// Session lifecycle.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Topic lifecycle.
    #[serde(default)]
    pub topics: TopicsConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Token authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Client transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Time allowed for the `connect` frame after upgrade, in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// One peer node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    /// Node name.
    pub name: String,
    /// Cluster listener address (`host:port`).
    pub address: String,
}

/// Cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Name of this node.
    #[serde(default = "default_node_name")]
    pub node: String,

    /// Address of this node's cluster listener.
    #[serde(default = "default_cluster_listen")]
    pub listen: String,

    /// The other nodes of the cluster. Empty for a standalone node.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Virtual points per node on the hash ring.
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Timeout of one cluster RPC, in milliseconds.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Retries after a failed forward.
    #[serde(default = "default_rpc_retries")]
    pub rpc_retries: u32,

    /// Period of health pings, in milliseconds.
    #[serde(default = "default_health_interval")]
    pub health_interval_ms: u64,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Inactivity after which a session is evicted, in milliseconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Extra time granted to long-poll sessions, in milliseconds.
    #[serde(default = "default_long_poll_grace")]
    pub long_poll_grace_ms: u64,

    /// Period of the idle sweep, in milliseconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Frames buffered per session before it is disconnected.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

/// Topic lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    /// Time an empty topic survives, in milliseconds.
    #[serde(default = "default_topic_grace")]
    pub grace_ms: u64,

    /// Mailbox capacity of each topic.
    #[serde(default = "default_mailbox")]
    pub mailbox: usize,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of topics on this node.
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,

    /// Maximum subscriptions per session.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_session: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Token authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accept connections without a token.
    #[serde(default)]
    pub allow_anonymous: bool,

    /// Known tokens and the users they authenticate. When empty, the token
    /// itself is taken as the user id.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/v0/channels".to_string()
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_node_name() -> String {
    "node1".to_string()
}

fn default_cluster_listen() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_replicas() -> usize {
    20
}

fn default_rpc_timeout() -> u64 {
    3_000
}

fn default_rpc_retries() -> u32 {
    2
}

fn default_health_interval() -> u64 {
    2_000
}

fn default_idle_timeout() -> u64 {
    55_000
}

fn default_long_poll_grace() -> u64 {
    15_000
}

fn default_sweep_interval() -> u64 {
    5_000
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_topic_grace() -> u64 {
    5_000
}

fn default_mailbox() -> usize {
    500
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_topics() -> usize {
    10_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            cluster: ClusterSection::default(),
            sessions: SessionsConfig::default(),
            topics: TopicsConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            node: default_node_name(),
            listen: default_cluster_listen(),
            peers: Vec::new(),
            replicas: default_replicas(),
            rpc_timeout_ms: default_rpc_timeout(),
            rpc_retries: default_rpc_retries(),
            health_interval_ms: default_health_interval(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout(),
            long_poll_grace_ms: default_long_poll_grace(),
            sweep_interval_ms: default_sweep_interval(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_topic_grace(),
            mailbox: default_mailbox(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_topics: default_max_topics(),
            max_subscriptions_per_session: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, overlaid with
    /// `COURIER__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = Self::find_file() {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    fn find_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("COURIER_CONFIG") {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];
        config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_topics: self.limits.max_topics,
            topic: TopicConfig {
                grace: Duration::from_millis(self.topics.grace_ms),
                mailbox: self.topics.mailbox,
                ..TopicConfig::default()
            },
            session: SessionConfig {
                idle_timeout: Duration::from_millis(self.sessions.idle_timeout_ms),
                long_poll_grace: Duration::from_millis(self.sessions.long_poll_grace_ms),
                sweep_interval: Duration::from_millis(self.sessions.sweep_interval_ms),
                outbound_capacity: self.sessions.outbound_capacity,
                max_subscriptions: self.limits.max_subscriptions_per_session,
            },
            ..HubConfig::default()
        }
    }

    /// Cluster settings; every node, this one included.
    #[must_use]
    pub fn cluster_config(&self) -> ClusterConfig {
        let this = NodeConfig {
            name: self.cluster.node.clone(),
            address: self.cluster.listen.clone(),
        };
        let peers = self.cluster.peers.iter().map(|peer| NodeConfig {
            name: peer.name.clone(),
            address: peer.address.clone(),
        });

        ClusterConfig {
            nodes: std::iter::once(this).chain(peers).collect(),
            replicas: self.cluster.replicas,
            rpc_timeout: Duration::from_millis(self.cluster.rpc_timeout_ms),
            rpc_retries: self.cluster.rpc_retries,
            health_interval: Duration::from_millis(self.cluster.health_interval_ms),
            ..ClusterConfig::standalone(self.cluster.node.clone())
        }
    }
}
