//! Routed request envelopes and their replies.
//!
//! An [`Envelope`] is what the hub hands to a topic actor (local or proxy).
//! Envelopes and replies are serializable so a proxy can ship them to the
//! owning node unchanged.

use bytes::Bytes;
use courier_protocol::{AccessMode, Frame, TopicDescription};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CourierError;
use crate::session::{Identity, SessionId};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Action requested on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Attach the session to the topic.
    Subscribe { mode: AccessMode },
    /// Detach the session; `unsubscribe` also drops the persisted membership.
    Leave { unsubscribe: bool },
    /// Publish a message.
    Publish { payload: Bytes },
    /// Change the session's presence data.
    PresenceChange { data: Option<serde_json::Value> },
    /// Describe the topic.
    GetInfo,
    /// Replace the public topic metadata.
    SetInfo { info: serde_json::Value },
}

impl Action {
    /// Whether this action may bring a topic into existence.
    #[must_use]
    pub fn creates_topic(&self) -> bool {
        matches!(self, Action::Subscribe { .. })
    }

    /// Short name for logs and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Action::Subscribe { .. } => "subscribe",
            Action::Leave { .. } => "leave",
            Action::Publish { .. } => "publish",
            Action::PresenceChange { .. } => "presence",
            Action::GetInfo => "get_info",
            Action::SetInfo { .. } => "set_info",
        }
    }
}

/// Where a request entered the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Origin {
    /// From a session attached to this node.
    #[default]
    Local,
    /// Forwarded by a proxy topic on another node.
    Remote(String),
}

/// A request routed to one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Topic name.
    pub topic: String,
    /// Requesting session.
    pub session: SessionId,
    /// Identity of the requesting session.
    pub identity: Identity,
    /// Client-supplied request id, echoed in replies.
    pub request_id: u64,
    /// What to do.
    pub action: Action,
    /// When the node accepted the request (ms since epoch).
    pub timestamp: u64,
    /// Set by the receiving hub, never serialized.
    #[serde(skip)]
    pub origin: Origin,
}

impl Envelope {
    /// Create a new locally originated envelope.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        session: SessionId,
        identity: Identity,
        request_id: u64,
        action: Action,
    ) -> Self {
        Self {
            topic: topic.into(),
            session,
            identity,
            request_id,
            action,
            timestamp: now_millis(),
            origin: Origin::Local,
        }
    }
}

/// Successful outcome of a routed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Attached; the topic snapshot as seen by the new subscriber.
    Subscribed(TopicDescription),
    /// Detached (or was never attached).
    Left,
    /// Published under `seq`.
    Published { seq: u64, timestamp: u64 },
    /// Presence data accepted and broadcast.
    PresenceUpdated,
    /// Topic description.
    Info(TopicDescription),
    /// Public metadata replaced.
    InfoUpdated,
    /// The topic is loaded and serving.
    Live,
}

impl Reply {
    /// Render the client frame answering request `id` on `topic`.
    #[must_use]
    pub fn to_frame(&self, id: u64, topic: &str) -> Frame {
        match self {
            Reply::Subscribed(description) | Reply::Info(description) => Frame::Info {
                id,
                description: description.clone(),
            },
            Reply::Published { seq, timestamp } => Frame::ack(id, topic, Some(*seq), *timestamp),
            Reply::Left | Reply::PresenceUpdated | Reply::InfoUpdated | Reply::Live => {
                Frame::ack(id, topic, None, now_millis())
            }
        }
    }
}

/// Result type of a routed request.
pub type RouteResult = Result<Reply, CourierError>;
