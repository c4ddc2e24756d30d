//! Sessions and the session registry.
//!
//! A session is one client connection, whatever the transport. The
//! [`SessionStore`] owns every live session; topics only keep a clone of the
//! session's [`Outbound`] handle.

use courier_protocol::Frame;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::error::CourierError;

/// Unique identifier of a session, `<node>-<hex counter>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Build the id of the `counter`-th session registered on `node`.
    #[must_use]
    pub fn generate(node: &str, counter: u64) -> Self {
        Self(format!("{node}-{counter:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Authenticated user reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a user id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is behind a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    Anonymous,
    User(UserId),
}

impl Identity {
    /// Shorthand for an authenticated identity.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Identity::User(UserId::new(id))
    }

    /// The user, if authenticated.
    #[must_use]
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Identity::Anonymous => None,
            Identity::User(user) => Some(user),
        }
    }
}

/// Transport family of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Persistent duplex connection (WebSocket).
    Streaming,
    /// Poll-based transport; clients are expected to reconnect between polls.
    LongPoll,
}

/// Why a frame could not be queued for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The session's outbound handle is closed.
    #[error("session closed")]
    Closed,
    /// The outbound queue was full; the session has been disconnected.
    #[error("outbound queue full")]
    Backpressure,
}

/// Send/close capability of a session, shared with the topics it joined.
#[derive(Debug, Clone)]
pub struct Outbound {
    sender: mpsc::Sender<Arc<Frame>>,
    closed: CancellationToken,
}

/// Transport side of an [`Outbound`] handle.
#[derive(Debug)]
pub struct OutboundReceiver {
    receiver: mpsc::Receiver<Arc<Frame>>,
    closed: CancellationToken,
}

impl Outbound {
    /// Create a bounded outbound queue.
    #[must_use]
    pub fn channel(capacity: usize) -> (Outbound, OutboundReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        (
            Outbound {
                sender,
                closed: closed.clone(),
            },
            OutboundReceiver { receiver, closed },
        )
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue means the client cannot keep up: the session is closed
    /// instead of buffering without bound.
    pub fn deliver(&self, frame: Arc<Frame>) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.closed.cancel();
                Err(DeliveryError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.cancel();
                Err(DeliveryError::Closed)
            }
        }
    }

    /// Close the session's transport.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the handle can no longer deliver.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }

    /// Resolves once the handle is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

impl OutboundReceiver {
    /// Next frame to write, or `None` once the session was closed.
    pub async fn recv(&mut self) -> Option<Arc<Frame>> {
        tokio::select! {
            biased;
            frame = self.receiver.recv() => frame,
            () = self.closed.cancelled() => None,
        }
    }

    /// Resolves when the session is closed from the node side.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

impl Drop for OutboundReceiver {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Session registry configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inactivity after which a session is evicted.
    pub idle_timeout: Duration,
    /// Extra time granted to long-poll sessions.
    pub long_poll_grace: Duration,
    /// Period of the idle sweep.
    pub sweep_interval: Duration,
    /// Capacity of each session's outbound queue.
    pub outbound_capacity: usize,
    /// Maximum topics one session may join.
    pub max_subscriptions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(55),
            long_poll_grace: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(5),
            outbound_capacity: 256,
            max_subscriptions: 100,
        }
    }
}

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Transport closed or explicit disconnect.
    Disconnected,
    /// No activity within the idle timeout.
    IdleTimeout,
}

/// A session removed from the registry whose subscriptions must be released.
#[derive(Debug, Clone)]
pub struct ReleasedSession {
    pub id: SessionId,
    pub identity: Identity,
    pub subscriptions: Vec<String>,
    pub reason: ReleaseReason,
}

/// A live session.
#[derive(Debug)]
struct Session {
    identity: Identity,
    transport: TransportKind,
    outbound: Outbound,
    subscriptions: HashSet<String>,
    last_active: Instant,
}

/// Registry of live sessions.
pub struct SessionStore {
    node: String,
    sessions: DashMap<SessionId, Session>,
    next_id: AtomicU64,
    config: SessionConfig,
    releases: mpsc::UnboundedSender<ReleasedSession>,
}

impl SessionStore {
    /// Create a registry for `node`; released sessions are sent to `releases`.
    #[must_use]
    pub fn new(
        node: impl Into<String>,
        config: SessionConfig,
        releases: mpsc::UnboundedSender<ReleasedSession>,
    ) -> Self {
        Self {
            node: node.into(),
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            config,
            releases,
        }
    }

    /// Store configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a new session and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`CourierError::Protocol`] if the transport handle is already closed.
    pub fn register(
        &self,
        identity: Identity,
        transport: TransportKind,
        outbound: Outbound,
    ) -> Result<SessionId, CourierError> {
        if outbound.is_closed() {
            return Err(CourierError::Protocol("transport handle is closed".into()));
        }

        let id = SessionId::generate(&self.node, self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.insert(
            id.clone(),
            Session {
                identity,
                transport,
                outbound,
                subscriptions: HashSet::new(),
                last_active: Instant::now(),
            },
        );

        debug!(session = %id, ?transport, "Session registered");
        Ok(id)
    }

    /// Remove a session, close its transport and release its subscriptions.
    ///
    /// Returns `false` if the session was unknown.
    pub fn unregister(&self, id: &SessionId) -> bool {
        self.release(id, ReleaseReason::Disconnected)
    }

    fn release(&self, id: &SessionId, reason: ReleaseReason) -> bool {
        let Some((id, session)) = self.sessions.remove(id) else {
            return false;
        };
        session.outbound.close();

        debug!(
            session = %id,
            ?reason,
            subscriptions = session.subscriptions.len(),
            "Session released"
        );

        let released = ReleasedSession {
            id,
            identity: session.identity,
            subscriptions: session.subscriptions.into_iter().collect(),
            reason,
        };
        if self.releases.send(released).is_err() {
            warn!("Session release channel closed");
        }
        true
    }

    /// Record inbound activity.
    ///
    /// Returns `false` if the session is unknown.
    pub fn touch(&self, id: &SessionId) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Evict every session idle for longer than its allowance.
    ///
    /// Returns the evicted session ids.
    pub fn sweep(&self, now: Instant) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                let mut allowance = self.config.idle_timeout;
                if session.transport == TransportKind::LongPoll {
                    allowance += self.config.long_poll_grace;
                }
                now.saturating_duration_since(session.last_active) > allowance
            })
            .map(|entry| entry.key().clone())
            .collect();

        let evicted: Vec<SessionId> = expired
            .into_iter()
            .filter(|id| self.release(id, ReleaseReason::IdleTimeout))
            .collect();

        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted idle sessions");
        }
        evicted
    }

    /// Outbound handle of a session.
    #[must_use]
    pub fn outbound(&self, id: &SessionId) -> Option<Outbound> {
        self.sessions.get(id).map(|s| s.outbound.clone())
    }

    /// Identity of a session.
    #[must_use]
    pub fn identity(&self, id: &SessionId) -> Option<Identity> {
        self.sessions.get(id).map(|s| s.identity.clone())
    }

    /// Whether the session is registered.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Check that the session may join one more topic.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` or `LimitReached`.
    pub fn check_subscription_limit(&self, id: &SessionId, topic: &str) -> Result<(), CourierError> {
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| CourierError::SessionNotFound(id.to_string()))?;
        if !session.subscriptions.contains(topic)
            && session.subscriptions.len() >= self.config.max_subscriptions
        {
            return Err(CourierError::LimitReached(format!(
                "at most {} subscriptions per session",
                self.config.max_subscriptions
            )));
        }
        Ok(())
    }

    /// Record that the session joined `topic`.
    ///
    /// # Errors
    ///
    /// Returns `SessionEvicted` if the session left the registry meanwhile.
    pub fn add_subscription(&self, id: &SessionId, topic: &str) -> Result<(), CourierError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| CourierError::SessionEvicted(id.to_string()))?;
        session.subscriptions.insert(topic.to_string());
        Ok(())
    }

    /// Record that the session left `topic`.
    pub fn remove_subscription(&self, id: &SessionId, topic: &str) -> bool {
        self.sessions
            .get_mut(id)
            .map(|mut s| s.subscriptions.remove(topic))
            .unwrap_or(false)
    }

    /// Topics the session has joined.
    #[must_use]
    pub fn subscriptions(&self, id: &SessionId) -> Vec<String> {
        self.sessions
            .get(id)
            .map(|s| s.subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(config: SessionConfig) -> (SessionStore, mpsc::UnboundedReceiver<ReleasedSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionStore::new("n1", config, tx), rx)
    }

    #[test]
    fn test_register_issues_unique_ids() {
        let (store, _rx) = store(SessionConfig::default());
        let (out1, _r1) = Outbound::channel(4);
        let (out2, _r2) = Outbound::channel(4);

        let a = store
            .register(Identity::user("alice"), TransportKind::Streaming, out1)
            .unwrap();
        let b = store
            .register(Identity::Anonymous, TransportKind::Streaming, out2)
            .unwrap();

        assert_ne!(a, b);
        assert!(a.as_str().starts_with("n1-"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.identity(&a), Some(Identity::user("alice")));
    }

    #[test]
    fn test_register_rejects_closed_transport() {
        let (store, _rx) = store(SessionConfig::default());
        let (out, receiver) = Outbound::channel(4);
        drop(receiver);

        assert!(matches!(
            store.register(Identity::Anonymous, TransportKind::Streaming, out),
            Err(CourierError::Protocol(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_unknown_ids_are_not_found() {
        let (store, _rx) = store(SessionConfig::default());
        let ghost = SessionId::from("n1-ff");

        assert!(!store.touch(&ghost));
        assert!(!store.unregister(&ghost));
        assert!(store.outbound(&ghost).is_none());
        assert!(store.subscriptions(&ghost).is_empty());
        assert!(matches!(
            store.add_subscription(&ghost, "grp1"),
            Err(CourierError::SessionEvicted(_))
        ));
    }

    #[test]
    fn test_unregister_releases_subscriptions() {
        let (store, mut rx) = store(SessionConfig::default());
        let (out, receiver) = Outbound::channel(4);
        let id = store
            .register(Identity::user("alice"), TransportKind::Streaming, out)
            .unwrap();
        store.add_subscription(&id, "grp1").unwrap();
        store.add_subscription(&id, "grp2").unwrap();

        assert!(store.unregister(&id));
        assert!(!store.contains(&id));

        let released = rx.try_recv().unwrap();
        assert_eq!(released.id, id);
        assert_eq!(released.reason, ReleaseReason::Disconnected);
        let mut topics = released.subscriptions;
        topics.sort();
        assert_eq!(topics, vec!["grp1".to_string(), "grp2".to_string()]);

        // The transport side observes the close.
        assert!(receiver.closed.is_cancelled());
    }

    #[test]
    fn test_subscription_limit() {
        let config = SessionConfig {
            max_subscriptions: 1,
            ..SessionConfig::default()
        };
        let (store, _rx) = store(config);
        let (out, _receiver) = Outbound::channel(4);
        let id = store
            .register(Identity::Anonymous, TransportKind::Streaming, out)
            .unwrap();

        store.check_subscription_limit(&id, "grp1").unwrap();
        store.add_subscription(&id, "grp1").unwrap();
        // Re-joining the same topic does not count twice.
        store.check_subscription_limit(&id, "grp1").unwrap();
        assert!(matches!(
            store.check_subscription_limit(&id, "grp2"),
            Err(CourierError::LimitReached(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_sessions() {
        let config = SessionConfig {
            idle_timeout: Duration::from_secs(10),
            long_poll_grace: Duration::from_secs(5),
            ..SessionConfig::default()
        };
        let (store, mut rx) = store(config);
        let (ws_out, _ws_rx) = Outbound::channel(4);
        let (lp_out, _lp_rx) = Outbound::channel(4);
        let (busy_out, _busy_rx) = Outbound::channel(4);

        let ws = store
            .register(Identity::Anonymous, TransportKind::Streaming, ws_out)
            .unwrap();
        let lp = store
            .register(Identity::Anonymous, TransportKind::LongPoll, lp_out)
            .unwrap();
        let busy = store
            .register(Identity::Anonymous, TransportKind::Streaming, busy_out)
            .unwrap();
        store.add_subscription(&ws, "grp1").unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        store.touch(&busy);
        tokio::time::advance(Duration::from_secs(3)).await;

        // 11s idle: the streaming session is gone, long-poll still has grace.
        let evicted = store.sweep(Instant::now());
        assert_eq!(evicted, vec![ws.clone()]);
        let released = rx.try_recv().unwrap();
        assert_eq!(released.reason, ReleaseReason::IdleTimeout);
        assert_eq!(released.subscriptions, vec!["grp1".to_string()]);

        tokio::time::advance(Duration::from_secs(5)).await;
        let evicted = store.sweep(Instant::now());
        assert_eq!(evicted, vec![lp]);
        assert!(store.contains(&busy));
    }

    #[test]
    fn test_full_queue_disconnects() {
        let (out, mut receiver) = Outbound::channel(1);
        out.deliver(Arc::new(Frame::ping())).unwrap();
        assert_eq!(
            out.deliver(Arc::new(Frame::ping())),
            Err(DeliveryError::Backpressure)
        );
        assert!(out.is_closed());
        assert_eq!(
            out.deliver(Arc::new(Frame::ping())),
            Err(DeliveryError::Closed)
        );
        // Closed receivers stop yielding frames.
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        assert!(rt.block_on(receiver.recv()).is_none());
    }
}
