//! # courier-core
//!
//! Sessions, topic actors, the hub and cluster routing for the Courier
//! realtime messaging engine.
//!
//! This crate provides the building blocks of a Courier node:
//!
//! - **Session** - Registry of connected clients and their subscriptions
//! - **Topic** - One actor per topic, authoritative or proxy
//! - **Hub** - Topic registry, request routing and garbage collection
//! - **Cluster** - Consistent-hash ownership, node health and RPC links
//! - **Store** / **Push** - Persistence and offline notification seams
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│     Hub     │────▶│ Topic actor │──▶ TopicStore
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └────────────│ Proxy topic │◀───▶│   Cluster   │◀──▶ peers
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! Every topic has exactly one authoritative actor in the cluster, on the
//! node the hash ring assigns it to. Other nodes with local subscribers run
//! a proxy that forwards requests to the owner and fans relayed broadcasts
//! out to its sessions.

pub mod cluster;
pub mod error;
pub mod hub;
pub mod message;
pub mod presence;
pub mod push;
pub mod session;
pub mod store;
pub mod topic;

pub use cluster::tcp::TcpLink;
pub use cluster::{
    Cluster, ClusterConfig, ClusterLink, ClusterService, MemoryNetwork, NodeConfig, NodeHealth,
};
pub use error::CourierError;
pub use hub::{Hub, HubConfig, HubStats};
pub use message::{Action, Envelope, Reply, RouteResult};
pub use presence::{Presence, PresenceState};
pub use push::{MemoryPush, NoopPush, PushNotifier, PushSummary, TracingPush};
pub use session::{
    Identity, Outbound, OutboundReceiver, SessionConfig, SessionId, SessionStore, TransportKind,
    UserId,
};
pub use store::{MemoryStore, StoreError, TopicRecord, TopicStore};
pub use topic::{TopicConfig, TopicHandle, TopicRole, TopicState};
