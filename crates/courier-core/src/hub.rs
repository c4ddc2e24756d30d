//! The hub: topic registry and request router of one node.
//!
//! The hub maps topic names to running actors (authoritative or proxy),
//! creates them on first use, retires them once they have been empty for the
//! grace interval, and moves them when cluster ownership changes. Creation,
//! retirement and migration of one name are serialized by a striped async
//! lock; everything else goes straight to the actor's mailbox.

use async_trait::async_trait;
use bytes::Bytes;
use courier_protocol::cluster::encode_body;
use courier_protocol::{AccessMode, ClusterAction, ClusterFrame, Frame};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cluster::{Cluster, ClusterService};
use crate::error::CourierError;
use crate::message::{Action, Envelope, Origin, Reply, RouteResult};
use crate::push::PushNotifier;
use crate::session::{
    Identity, Outbound, ReleasedSession, SessionConfig, SessionId, SessionStore, TransportKind,
};
use crate::store::TopicStore;
use crate::topic::{
    self, validate_topic_name, HandoffMember, Link, RetireOutcome, TopicCommand, TopicConfig,
    TopicContext, TopicHandle, TopicRole,
};

/// Attempts to reach a topic whose mailbox was swapped underneath a request.
const ROUTE_ATTEMPTS: usize = 3;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of topics (authoritative and proxy) on this node.
    pub max_topics: usize,
    /// Number of creation-lock stripes.
    pub lock_stripes: usize,
    pub topic: TopicConfig,
    pub session: SessionConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_topics: 10_000,
            lock_stripes: 64,
            topic: TopicConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Authoritative topics.
    pub topics: usize,
    /// Proxy topics.
    pub proxies: usize,
    /// Live sessions.
    pub sessions: usize,
}

/// Topic registry and dispatcher of one node.
pub struct Hub {
    node: String,
    topics: DashMap<String, TopicHandle>,
    locks: Vec<Mutex<()>>,
    sessions: Arc<SessionStore>,
    cluster: Arc<Cluster>,
    context: Arc<TopicContext>,
    config: HubConfig,
    releases: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ReleasedSession>>>,
    rebalance_pending: AtomicBool,
    shutdown: CancellationToken,
}

impl Hub {
    /// Create a hub for the node described by `cluster`.
    ///
    /// Nothing runs until [`Hub::start`] is called.
    #[must_use]
    pub fn new(
        config: HubConfig,
        cluster: Arc<Cluster>,
        store: Arc<dyn TopicStore>,
        push: Arc<dyn PushNotifier>,
    ) -> Arc<Self> {
        let node = cluster.node().to_string();
        let (releases_tx, releases_rx) = mpsc::unbounded_channel();
        let sessions = Arc::new(SessionStore::new(
            node.clone(),
            config.session.clone(),
            releases_tx,
        ));
        let context = Arc::new(TopicContext {
            node: node.clone(),
            store,
            push,
            cluster: cluster.clone(),
            config: config.topic.clone(),
        });
        let locks = (0..config.lock_stripes.max(1))
            .map(|_| Mutex::new(()))
            .collect();

        info!(node = %node, max_topics = config.max_topics, "Creating hub");

        Arc::new(Self {
            node,
            topics: DashMap::new(),
            locks,
            sessions,
            cluster,
            context,
            config,
            releases: std::sync::Mutex::new(Some(releases_rx)),
            rebalance_pending: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the background tasks: session release, garbage collection,
    /// idle sweep, membership watch and cluster health checks.
    pub fn start(self: &Arc<Self>) {
        let releases = self
            .releases
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(mut releases) = releases {
            let hub = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = hub.shutdown.cancelled() => break,
                        released = releases.recv() => {
                            let Some(released) = released else { break };
                            let hub = Arc::clone(&hub);
                            tokio::spawn(async move { hub.release(released).await });
                        }
                    }
                }
            });
        }

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.config.topic.gc_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = hub.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        hub.collect_garbage().await;
                        if hub.rebalance_pending.swap(false, Ordering::AcqRel) {
                            hub.rebalance().await;
                        }
                    }
                }
            }
        });

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.sessions.config().sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = hub.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        hub.sessions.sweep(Instant::now());
                    }
                }
            }
        });

        let hub = Arc::clone(self);
        let mut membership = self.cluster.watch();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = hub.shutdown.cancelled() => break,
                    changed = membership.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        hub.rebalance().await;
                    }
                }
            }
        });

        tokio::spawn(Arc::clone(&self.cluster).run_health_checks());
        info!(node = %self.node, "Hub started");
    }

    /// Stop background tasks and drop every topic.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.cluster.shutdown();
        self.topics.clear();
        info!(node = %self.node, "Hub shut down");
    }

    /// Name of this node.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Session registry of this node.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Cluster view of this node.
    #[must_use]
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Handle of a topic known to this node.
    #[must_use]
    pub fn topic(&self, name: &str) -> Option<TopicHandle> {
        self.topics.get(name).map(|h| h.clone())
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let (mut topics, mut proxies) = (0, 0);
        for entry in &self.topics {
            match entry.role() {
                TopicRole::Local => topics += 1,
                TopicRole::Proxy { .. } => proxies += 1,
            }
        }
        HubStats {
            topics,
            proxies,
            sessions: self.sessions.len(),
        }
    }

    async fn lock(&self, topic: &str) -> MutexGuard<'_, ()> {
        let stripe = crc32c::crc32c(topic.as_bytes()) as usize % self.locks.len();
        self.locks[stripe].lock().await
    }

    /// Find or create the actor serving `topic`.
    ///
    /// `Ok(None)` means the topic is owned here, does not exist, and the
    /// request may not create it.
    async fn resolve(
        &self,
        topic: &str,
        creates: bool,
        origin: &Origin,
    ) -> Result<Option<TopicHandle>, CourierError> {
        let not_owner = || {
            CourierError::ClusterUnreachable(format!("{} does not own {topic}", self.node))
        };
        let accept = |handle: TopicHandle| match (origin, handle.role()) {
            (Origin::Remote(_), TopicRole::Proxy { .. }) => Err(not_owner()),
            _ => Ok(Some(handle)),
        };

        if let Some(handle) = self.topic(topic) {
            return accept(handle);
        }

        let owner = self.cluster.resolve_owner(topic);
        let local = owner == self.node;
        if !local && matches!(origin, Origin::Remote(_)) {
            return Err(not_owner());
        }
        if local && !creates {
            return Ok(None);
        }

        let _guard = self.lock(topic).await;
        if let Some(handle) = self.topic(topic) {
            return accept(handle);
        }
        if self.topics.len() >= self.config.max_topics {
            return Err(CourierError::LimitReached(format!(
                "at most {} topics per node",
                self.config.max_topics
            )));
        }

        let handle = if local {
            topic::spawn_local(topic, Arc::clone(&self.context))
        } else {
            topic::spawn_proxy(topic, &owner, Arc::clone(&self.context))
        };
        self.topics.insert(topic.to_string(), handle.clone());
        debug!(topic = %topic, owner = %owner, "Topic created");
        Ok(Some(handle))
    }

    /// Drop a topic whose actor is gone, unless it was replaced meanwhile.
    async fn evict_closed(&self, topic: &str, stale: &TopicHandle) {
        let _guard = self.lock(topic).await;
        let dead = self
            .topics
            .get(topic)
            .is_some_and(|h| h.same_mailbox(stale) && h.sender().is_closed());
        if dead {
            self.topics.remove(topic);
            debug!(topic = %topic, "Removed stopped topic");
        }
    }

    /// Route a request to the actor of its topic and wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns the actor's error, `TopicNotFound` for non-creating requests
    /// on unknown local topics, or `ClusterUnreachable`.
    pub async fn route(&self, envelope: Envelope) -> RouteResult {
        validate_topic_name(&envelope.topic)?;
        let link = self.link_for(&envelope)?;
        let mut envelope = envelope;

        for attempt in 1..=ROUTE_ATTEMPTS {
            let creates = envelope.action.creates_topic();
            let Some(handle) = self
                .resolve(&envelope.topic, creates, &envelope.origin)
                .await?
            else {
                return match envelope.action {
                    Action::Leave { .. } => Ok(Reply::Left),
                    _ => Err(CourierError::TopicNotFound(envelope.topic)),
                };
            };

            let (respond_to, reply) = oneshot::channel();
            let command = TopicCommand::Request {
                envelope,
                link: link.clone(),
                respond_to,
            };
            match handle.sender().send(command).await {
                Ok(()) => {
                    return reply.await.unwrap_or_else(|_| {
                        Err(CourierError::Internal("topic dropped the request".into()))
                    });
                }
                Err(mpsc::error::SendError(command)) => {
                    envelope = match command {
                        TopicCommand::Request { envelope, .. } => envelope,
                        _ => return Err(CourierError::Internal("mailbox returned a foreign command".into())),
                    };
                    trace!(topic = %envelope.topic, attempt, "Topic mailbox closed, retrying");
                    self.evict_closed(&envelope.topic, &handle).await;
                }
            }
        }
        Err(CourierError::Internal(format!(
            "{} unavailable after {ROUTE_ATTEMPTS} attempts",
            envelope.topic
        )))
    }

    fn link_for(&self, envelope: &Envelope) -> Result<Option<Link>, CourierError> {
        if !matches!(envelope.action, Action::Subscribe { .. }) {
            return Ok(None);
        }
        match &envelope.origin {
            Origin::Remote(node) => Ok(Some(Link::Remote(node.clone()))),
            Origin::Local => self
                .sessions
                .outbound(&envelope.session)
                .map(|outbound| Some(Link::Local(outbound)))
                .ok_or_else(|| CourierError::SessionNotFound(envelope.session.to_string())),
        }
    }

    /// Register a new session.
    ///
    /// # Errors
    ///
    /// Fails if the transport handle is already closed.
    pub fn connect(
        &self,
        identity: Identity,
        transport: TransportKind,
        outbound: Outbound,
    ) -> Result<SessionId, CourierError> {
        self.sessions.register(identity, transport, outbound)
    }

    /// Remove a session; its subscriptions are released in the background.
    pub fn disconnect(&self, session: &SessionId) -> bool {
        self.sessions.unregister(session)
    }

    fn identity(&self, session: &SessionId) -> Result<Identity, CourierError> {
        self.sessions
            .identity(session)
            .ok_or_else(|| CourierError::SessionNotFound(session.to_string()))
    }

    /// Attach a session to a topic, creating the topic if needed.
    ///
    /// # Errors
    ///
    /// Returns `LimitReached`, `PermissionDenied`, `StoreFailure` or a routing error.
    pub async fn join(
        &self,
        session: &SessionId,
        topic: &str,
        mode: AccessMode,
        request_id: u64,
    ) -> RouteResult {
        let identity = self.identity(session)?;
        self.sessions.check_subscription_limit(session, topic)?;

        let envelope = Envelope::new(
            topic,
            session.clone(),
            identity.clone(),
            request_id,
            Action::Subscribe { mode },
        );
        let reply = self.route(envelope).await?;

        if let Err(err) = self.sessions.add_subscription(session, topic) {
            // Evicted while subscribing: give the seat back.
            let leave = Envelope::new(
                topic,
                session.clone(),
                identity,
                0,
                Action::Leave { unsubscribe: false },
            );
            if let Err(leave_err) = self.route(leave).await {
                warn!(topic = %topic, session = %session, error = %leave_err, "Failed to release subscription");
            }
            return Err(err);
        }
        Ok(reply)
    }

    /// Detach a session from a topic.
    ///
    /// # Errors
    ///
    /// Returns `StoreFailure` when dropping the membership fails, or a routing error.
    pub async fn leave(
        &self,
        session: &SessionId,
        topic: &str,
        unsubscribe: bool,
        request_id: u64,
    ) -> RouteResult {
        let identity = self.identity(session)?;
        let envelope = Envelope::new(
            topic,
            session.clone(),
            identity,
            request_id,
            Action::Leave { unsubscribe },
        );
        let reply = self.route(envelope).await?;
        self.sessions.remove_subscription(session, topic);
        Ok(reply)
    }

    /// Publish a message.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied`, `TopicNotFound`, `StoreFailure` or a routing error.
    pub async fn publish(
        &self,
        session: &SessionId,
        topic: &str,
        payload: Bytes,
        request_id: u64,
    ) -> RouteResult {
        self.request(session, topic, request_id, Action::Publish { payload })
            .await
    }

    /// Change the session's presence data on a topic.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` when the session is not attached.
    pub async fn presence(
        &self,
        session: &SessionId,
        topic: &str,
        data: Option<serde_json::Value>,
        request_id: u64,
    ) -> RouteResult {
        self.request(session, topic, request_id, Action::PresenceChange { data })
            .await
    }

    /// Describe a topic.
    ///
    /// # Errors
    ///
    /// Returns `TopicNotFound` or a routing error.
    pub async fn get_info(&self, session: &SessionId, topic: &str, request_id: u64) -> RouteResult {
        self.request(session, topic, request_id, Action::GetInfo).await
    }

    /// Replace a topic's public metadata.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` unless the session is attached as admin.
    pub async fn set_info(
        &self,
        session: &SessionId,
        topic: &str,
        info: serde_json::Value,
        request_id: u64,
    ) -> RouteResult {
        self.request(session, topic, request_id, Action::SetInfo { info })
            .await
    }

    async fn request(
        &self,
        session: &SessionId,
        topic: &str,
        request_id: u64,
        action: Action,
    ) -> RouteResult {
        let identity = self.identity(session)?;
        self.route(Envelope::new(
            topic,
            session.clone(),
            identity,
            request_id,
            action,
        ))
        .await
    }

    /// Serve one client frame and render the reply, if any.
    pub async fn handle_frame(&self, session: &SessionId, frame: Frame) -> Option<Frame> {
        self.sessions.touch(session);

        let (id, topic, result) = match frame {
            Frame::Subscribe { id, topic, mode } => {
                let result = self.join(session, &topic, mode, id).await;
                (id, topic, result)
            }
            Frame::Leave {
                id,
                topic,
                unsubscribe,
            } => {
                let result = self.leave(session, &topic, unsubscribe, id).await;
                (id, topic, result)
            }
            Frame::Publish { id, topic, payload } => {
                let result = self.publish(session, &topic, Bytes::from(payload), id).await;
                (id, topic, result)
            }
            Frame::Presence { id, topic, data } => {
                let result = self.presence(session, &topic, data, id).await;
                (id, topic, result)
            }
            Frame::GetInfo { id, topic } => {
                let result = self.get_info(session, &topic, id).await;
                (id, topic, result)
            }
            Frame::SetInfo { id, topic, info } => {
                let result = self.set_info(session, &topic, info, id).await;
                (id, topic, result)
            }
            Frame::Ping { timestamp } => return Some(Frame::pong(timestamp)),
            Frame::Pong { .. } => return None,
            other => {
                let err = CourierError::Protocol(format!(
                    "unexpected {:?} frame",
                    other.frame_type()
                ));
                return Some(err.to_frame(0));
            }
        };

        Some(match result {
            Ok(reply) => reply.to_frame(id, &topic),
            Err(err) => {
                debug!(session = %session, topic = %topic, error = %err, "Request failed");
                err.to_frame(id)
            }
        })
    }

    /// Implicit leave of every topic a departed session had joined.
    async fn release(&self, released: ReleasedSession) {
        debug!(
            session = %released.id,
            reason = ?released.reason,
            topics = released.subscriptions.len(),
            "Releasing session"
        );
        for topic in released.subscriptions {
            let envelope = Envelope::new(
                topic,
                released.id.clone(),
                released.identity.clone(),
                0,
                Action::Leave { unsubscribe: false },
            );
            let name = envelope.topic.clone();
            match self.route(envelope).await {
                Ok(_) => {}
                // The proxy keeps retrying the leave until the owner confirms it.
                Err(CourierError::ClusterUnreachable(err)) => {
                    debug!(session = %released.id, topic = %name, error = %err, "Implicit leave deferred");
                }
                Err(err) => {
                    warn!(session = %released.id, topic = %name, error = %err, "Implicit leave failed");
                }
            }
        }
    }

    /// Retire topics that stayed empty for the grace interval.
    ///
    /// Returns the number of topics destroyed.
    pub async fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let grace = self.config.topic.grace;
        let candidates: Vec<(String, TopicHandle)> = self
            .topics
            .iter()
            .filter(|entry| entry.status().retire_due(now, grace))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut retired = 0;
        for (name, handle) in candidates {
            let _guard = self.lock(&name).await;
            let current = self
                .topics
                .get(&name)
                .is_some_and(|h| h.same_mailbox(&handle));
            if !current {
                continue;
            }

            let (respond_to, outcome) = oneshot::channel();
            if handle
                .sender()
                .send(TopicCommand::Retire { respond_to })
                .await
                .is_err()
            {
                self.topics.remove(&name);
                retired += 1;
                continue;
            }

            match outcome.await {
                Ok(RetireOutcome::Declined) => {}
                Ok(RetireOutcome::Revived(sender)) => {
                    if let Some(mut entry) = self.topics.get_mut(&name) {
                        entry.replace_sender(sender);
                    }
                }
                Ok(RetireOutcome::Retired) | Err(_) => {
                    self.topics.remove(&name);
                    retired += 1;
                    debug!(topic = %name, "Topic destroyed");
                }
            }
        }
        retired
    }

    /// Bring every topic in line with the current membership.
    pub async fn rebalance(&self) {
        let membership = self.cluster.membership();
        let down = membership.down_nodes();
        let handles: Vec<(String, TopicHandle)> = self
            .topics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        debug!(
            node = %self.node,
            version = membership.version(),
            topics = handles.len(),
            "Rebalancing"
        );

        for (name, handle) in handles {
            if !down.is_empty() && *handle.role() == TopicRole::Local {
                let prune = TopicCommand::PruneNodes { down: down.clone() };
                let _ = handle.sender().send(prune).await;
            }
            let Some(owner) = membership.owner(&name) else {
                continue;
            };
            if owner != handle.owner(&self.node) {
                if let Err(err) = self.migrate(&name, owner).await {
                    warn!(topic = %name, to = %owner, error = %err, "Migration failed");
                    self.rebalance_pending.store(true, Ordering::Release);
                }
            }
        }
    }

    /// Move `topic` to `new_owner`.
    ///
    /// A remote new owner must confirm the topic is live before the local
    /// actor is replaced. Local subscribers are re-subscribed through the
    /// replacement and queued requests are replayed into it.
    ///
    /// # Errors
    ///
    /// Returns `ClusterUnreachable` if the new owner cannot load the topic.
    pub async fn migrate(&self, topic: &str, new_owner: &str) -> Result<(), CourierError> {
        if new_owner != self.node {
            self.cluster.load(new_owner, topic).await?;
        }

        let _guard = self.lock(topic).await;
        let Some(handle) = self.topic(topic) else {
            return Ok(());
        };
        if handle.owner(&self.node) == new_owner {
            return Ok(());
        }

        let (respond_to, state) = oneshot::channel();
        if handle
            .sender()
            .send(TopicCommand::Handoff { respond_to })
            .await
            .is_err()
        {
            self.topics.remove(topic);
            return Ok(());
        }
        let Ok(state) = state.await else {
            self.topics.remove(topic);
            return Err(CourierError::Internal(format!(
                "{topic} stopped during handoff"
            )));
        };

        let replacement = if new_owner == self.node {
            topic::spawn_local(topic, Arc::clone(&self.context))
        } else {
            topic::spawn_proxy(topic, new_owner, Arc::clone(&self.context))
        };
        self.topics.insert(topic.to_string(), replacement.clone());

        info!(
            topic = %topic,
            from = %handle.owner(&self.node),
            to = %new_owner,
            members = state.members.len(),
            queued = state.leftovers.len(),
            "Topic migrated"
        );

        // Re-subscribes settle first so no replayed request of the same
        // session overtakes them on the way to the owner.
        let mut replies = Vec::with_capacity(state.members.len());
        for member in state.members {
            if let Some(reply) = self.resubscribe(topic, &replacement, member).await {
                replies.push(reply);
            }
        }
        let settled = futures_util::future::join_all(
            replies
                .into_iter()
                .map(|(session, reply)| async move { (session, reply.await) }),
        )
        .await;
        for (session, outcome) in settled {
            match outcome {
                Ok(Ok(_)) => trace!(topic = %topic, session = %session, "Re-subscribed"),
                Ok(Err(err)) => {
                    warn!(topic = %topic, session = %session, error = %err, "Re-subscribe failed");
                }
                Err(_) => warn!(topic = %topic, session = %session, "Re-subscribe dropped"),
            }
        }

        for command in state.leftovers {
            if let Err(mpsc::error::SendError(command)) = replacement.sender().send(command).await
            {
                command.reject(&CourierError::Internal(format!(
                    "{topic} stopped during migration"
                )));
            }
        }
        Ok(())
    }

    async fn resubscribe(
        &self,
        topic: &str,
        handle: &TopicHandle,
        member: HandoffMember,
    ) -> Option<(SessionId, oneshot::Receiver<RouteResult>)> {
        let session = member.session;
        let envelope = Envelope::new(
            topic,
            session.clone(),
            member.identity,
            0,
            Action::Subscribe { mode: member.mode },
        );
        let (respond_to, reply) = oneshot::channel();
        let command = TopicCommand::Request {
            envelope,
            link: Some(Link::Local(member.outbound)),
            respond_to,
        };
        if handle.sender().send(command).await.is_err() {
            warn!(topic = %topic, session = %session, "Replacement topic stopped");
            return None;
        }
        Some((session, reply))
    }

    async fn serve_route(&self, frame: &ClusterFrame) -> RouteResult {
        let mut envelope: Envelope = frame.body()?;
        envelope.origin = Origin::Remote(frame.source_node.clone());
        self.route(envelope).await
    }

    async fn serve_relay(&self, frame: &ClusterFrame) -> Result<(), CourierError> {
        let inner: Frame = frame.body()?;
        match self.topic(&frame.topic) {
            Some(handle) if matches!(handle.role(), TopicRole::Proxy { .. }) => {
                let relay = TopicCommand::Relay {
                    frame: Arc::new(inner),
                };
                if handle.sender().send(relay).await.is_err() {
                    trace!(topic = %frame.topic, "Proxy stopped before relay");
                }
            }
            _ => trace!(topic = %frame.topic, "Relay without proxy"),
        }
        Ok(())
    }

    async fn serve_load(&self, frame: &ClusterFrame) -> Result<(), CourierError> {
        validate_topic_name(&frame.topic)?;
        let origin = Origin::Remote(frame.source_node.clone());
        for _ in 0..ROUTE_ATTEMPTS {
            let Some(handle) = self.resolve(&frame.topic, true, &origin).await? else {
                continue;
            };
            let (respond_to, live) = oneshot::channel();
            if handle
                .sender()
                .send(TopicCommand::AwaitLive { respond_to })
                .await
                .is_err()
            {
                self.evict_closed(&frame.topic, &handle).await;
                continue;
            }
            return live
                .await
                .unwrap_or_else(|_| Err(CourierError::Internal("topic stopped while loading".into())))
                .map(|_| ());
        }
        Err(CourierError::Internal(format!(
            "{} could not be loaded",
            frame.topic
        )))
    }
}

fn encode_reply<T: Serialize>(value: &T) -> Vec<u8> {
    encode_body(value).unwrap_or_else(|err| {
        warn!(error = %err, "Failed to encode cluster reply");
        Vec::new()
    })
}

#[async_trait]
impl ClusterService for Hub {
    async fn handle(&self, frame: ClusterFrame) -> ClusterFrame {
        trace!(
            from = %frame.source_node,
            action = ?frame.action,
            topic = %frame.topic,
            "Cluster request"
        );
        let body = match frame.action {
            ClusterAction::Route => encode_reply(&self.serve_route(&frame).await),
            ClusterAction::Relay => encode_reply(&self.serve_relay(&frame).await),
            ClusterAction::Load => encode_reply(&self.serve_load(&frame).await),
            ClusterAction::Ping => encode_reply(&Ok::<(), CourierError>(())),
        };
        frame.respond(body)
    }
}
