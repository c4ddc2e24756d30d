//! Topic actors.
//!
//! Every topic known to a node is served by exactly one task draining one
//! bounded mailbox. On the owning node that task is the authoritative
//! [`actor`]; every other node that needs the topic runs a [`proxy`] that
//! forwards requests to the owner and re-delivers its broadcasts.

mod actor;
mod policy;
mod proxy;

use courier_protocol::{AccessMode, Frame};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::cluster::Cluster;
use crate::error::CourierError;
use crate::message::{Envelope, RouteResult};
use crate::push::PushNotifier;
use crate::session::{Identity, Outbound, SessionId};
use crate::store::TopicStore;

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 256;

/// Validate a topic name.
///
/// # Errors
///
/// Returns a protocol error if the name is empty, too long, reserved, or
/// contains non-printable characters.
pub fn validate_topic_name(name: &str) -> Result<(), CourierError> {
    let reason = if name.is_empty() {
        "Topic name cannot be empty"
    } else if name.len() > MAX_TOPIC_NAME_LENGTH {
        "Topic name too long"
    } else if name.starts_with('$') {
        "Topic names starting with '$' are reserved"
    } else if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        "Topic name contains invalid characters"
    } else {
        return Ok(());
    };
    Err(CourierError::Protocol(reason.to_string()))
}

/// Topic actor settings.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    /// How long an empty topic survives before it is destroyed.
    pub grace: Duration,
    /// Mailbox capacity of each actor.
    pub mailbox: usize,
    /// Period of the garbage-collection scan.
    pub gc_interval: Duration,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            mailbox: 500,
            gc_interval: Duration::from_secs(1),
        }
    }
}

/// Everything a topic actor needs from its node.
pub struct TopicContext {
    pub node: String,
    pub store: Arc<dyn TopicStore>,
    pub push: Arc<dyn PushNotifier>,
    pub cluster: Arc<Cluster>,
    pub config: TopicConfig,
}

/// Lifecycle state of a topic actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TopicState {
    Loading = 0,
    Live = 1,
    Dying = 2,
    Destroyed = 3,
}

impl From<u8> for TopicState {
    fn from(value: u8) -> Self {
        match value {
            0 => TopicState::Loading,
            1 => TopicState::Live,
            2 => TopicState::Dying,
            _ => TopicState::Destroyed,
        }
    }
}

/// State an actor publishes for the hub's garbage collector.
#[derive(Debug)]
pub struct TopicStatus {
    state: AtomicU8,
    subscribers: AtomicUsize,
    dying_since: Mutex<Option<Instant>>,
}

impl TopicStatus {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(TopicState::Loading as u8),
            subscribers: AtomicUsize::new(0),
            dying_since: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TopicState {
        TopicState::from(self.state.load(Ordering::Acquire))
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    /// Whether the topic has been empty for at least `grace`.
    #[must_use]
    pub fn retire_due(&self, now: Instant, grace: Duration) -> bool {
        if self.state() != TopicState::Dying {
            return false;
        }
        self.dying_since
            .lock()
            .ok()
            .and_then(|since| *since)
            .is_some_and(|since| now.saturating_duration_since(since) >= grace)
    }

    /// Loading finished. An empty topic stays Live until it has served a
    /// command, so a topic loaded ahead of its subscribers is not retired
    /// before they arrive.
    fn live(&self) {
        self.subscribers.store(0, Ordering::Release);
        if let Ok(mut since) = self.dying_since.lock() {
            *since = None;
        }
        self.state.store(TopicState::Live as u8, Ordering::Release);
    }

    /// Publish the subscriber count; an empty topic turns Dying, a non-empty one Live.
    fn update(&self, subscribers: usize) {
        self.subscribers.store(subscribers, Ordering::Release);
        let Ok(mut since) = self.dying_since.lock() else {
            return;
        };
        if subscribers == 0 {
            if since.is_none() {
                *since = Some(Instant::now());
            }
            self.state.store(TopicState::Dying as u8, Ordering::Release);
        } else {
            *since = None;
            self.state.store(TopicState::Live as u8, Ordering::Release);
        }
    }

    fn destroyed(&self) {
        self.state
            .store(TopicState::Destroyed as u8, Ordering::Release);
    }
}

/// Where a subscriber receives broadcasts.
#[derive(Debug, Clone)]
pub enum Link {
    /// A session attached to this node.
    Local(Outbound),
    /// Sessions attached through a proxy on another node.
    Remote(String),
}

/// Answer of an actor asked to retire.
#[derive(Debug)]
pub enum RetireOutcome {
    /// The actor has exited.
    Retired,
    /// Queued requests re-populated the topic; it keeps running on a new mailbox.
    Revived(mpsc::Sender<TopicCommand>),
    /// The topic is not ready to retire.
    Declined,
}

/// A local subscriber handed over during migration.
#[derive(Debug)]
pub struct HandoffMember {
    pub session: SessionId,
    pub identity: Identity,
    pub mode: AccessMode,
    pub outbound: Outbound,
}

/// What an actor leaves behind when it hands a topic over.
#[derive(Debug, Default)]
pub struct HandoffState {
    /// Subscribers attached on this node.
    pub members: Vec<HandoffMember>,
    /// Commands queued behind the handoff, to be replayed into the replacement.
    pub leftovers: Vec<TopicCommand>,
}

/// Mailbox item of a topic actor.
#[derive(Debug)]
pub enum TopicCommand {
    /// A routed client request.
    Request {
        envelope: Envelope,
        /// Delivery link of the requester, set for subscribes.
        link: Option<Link>,
        respond_to: oneshot::Sender<RouteResult>,
    },
    /// A broadcast relayed from the owning node.
    Relay { frame: Arc<Frame> },
    /// Retire the topic if it has been empty for the grace interval.
    Retire {
        respond_to: oneshot::Sender<RetireOutcome>,
    },
    /// Stop and hand local state to a replacement.
    Handoff {
        respond_to: oneshot::Sender<HandoffState>,
    },
    /// Reply once the topic is loaded.
    AwaitLive {
        respond_to: oneshot::Sender<RouteResult>,
    },
    /// Drop subscribers attached through the given nodes.
    PruneNodes { down: Vec<String> },
}

impl TopicCommand {
    /// Answer a command that can no longer be served.
    pub(crate) fn reject(self, err: &CourierError) {
        match self {
            TopicCommand::Request { respond_to, .. } | TopicCommand::AwaitLive { respond_to } => {
                let _ = respond_to.send(Err(err.clone()));
            }
            TopicCommand::Retire { respond_to } => {
                let _ = respond_to.send(RetireOutcome::Retired);
            }
            TopicCommand::Handoff { respond_to } => {
                let _ = respond_to.send(HandoffState::default());
            }
            TopicCommand::Relay { .. } | TopicCommand::PruneNodes { .. } => {}
        }
    }
}

/// Whether a handle drives an authoritative topic or a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRole {
    Local,
    Proxy { owner: String },
}

/// The hub's reference to a running topic actor.
#[derive(Debug, Clone)]
pub struct TopicHandle {
    role: TopicRole,
    sender: mpsc::Sender<TopicCommand>,
    status: Arc<TopicStatus>,
}

impl TopicHandle {
    /// Authoritative or proxy.
    #[must_use]
    pub fn role(&self) -> &TopicRole {
        &self.role
    }

    /// Node that owns the topic, as far as this handle knows.
    #[must_use]
    pub fn owner<'a>(&'a self, local_node: &'a str) -> &'a str {
        match &self.role {
            TopicRole::Local => local_node,
            TopicRole::Proxy { owner } => owner,
        }
    }

    /// Published actor state.
    #[must_use]
    pub fn status(&self) -> &TopicStatus {
        &self.status
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<TopicCommand> {
        &self.sender
    }

    pub(crate) fn replace_sender(&mut self, sender: mpsc::Sender<TopicCommand>) {
        self.sender = sender;
    }

    /// Whether both handles feed the same mailbox.
    #[must_use]
    pub fn same_mailbox(&self, other: &TopicHandle) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

/// Start the authoritative actor of `name` on this node.
pub(crate) fn spawn_local(name: &str, ctx: Arc<TopicContext>) -> TopicHandle {
    let (sender, receiver) = mpsc::channel(ctx.config.mailbox.max(1));
    let status = Arc::new(TopicStatus::new());
    let actor = actor::TopicActor::new(name, ctx, receiver, status.clone());
    tokio::spawn(actor.run());
    TopicHandle {
        role: TopicRole::Local,
        sender,
        status,
    }
}

/// Start a proxy for `name`, owned by `owner`.
pub(crate) fn spawn_proxy(name: &str, owner: &str, ctx: Arc<TopicContext>) -> TopicHandle {
    let (sender, receiver) = mpsc::channel(ctx.config.mailbox.max(1));
    let status = Arc::new(TopicStatus::new());
    let proxy = proxy::ProxyActor::new(name, owner, ctx, receiver, status.clone());
    tokio::spawn(proxy.run());
    TopicHandle {
        role: TopicRole::Proxy {
            owner: owner.to_string(),
        },
        sender,
        status,
    }
}
