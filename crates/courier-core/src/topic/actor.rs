//! The authoritative topic actor.

use bytes::Bytes;
use courier_protocol::{AccessMode, Frame, PresenceAction, SubscriberEntry, TopicDescription, TopicKind};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::policy::admit;
use super::{
    HandoffMember, HandoffState, Link, RetireOutcome, TopicCommand, TopicContext, TopicStatus,
};
use crate::error::CourierError;
use crate::message::{now_millis, Action, Envelope, Reply, RouteResult};
use crate::presence::Presence;
use crate::push::PushSummary;
use crate::session::{DeliveryError, Identity, SessionId, UserId};
use crate::store::StoreError;

#[derive(Debug)]
struct Subscriber {
    identity: Identity,
    mode: AccessMode,
    link: Link,
    last_seen: u64,
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct TopicActor {
    name: String,
    kind: TopicKind,
    ctx: Arc<TopicContext>,
    receiver: mpsc::Receiver<TopicCommand>,
    status: Arc<TopicStatus>,
    members: HashMap<UserId, AccessMode>,
    subscribers: HashMap<SessionId, Subscriber>,
    presence: Presence,
    last_seq: u64,
    public: Option<serde_json::Value>,
}

impl TopicActor {
    pub(crate) fn new(
        name: &str,
        ctx: Arc<TopicContext>,
        receiver: mpsc::Receiver<TopicCommand>,
        status: Arc<TopicStatus>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind: TopicKind::of(name),
            ctx,
            receiver,
            status,
            members: HashMap::new(),
            subscribers: HashMap::new(),
            presence: Presence::new(),
            last_seq: 0,
            public: None,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.ctx.store.load_topic(&self.name).await {
            Ok(record) => {
                self.members = record.members;
                self.last_seq = record.last_seq;
                self.public = record.public;
            }
            Err(err) => {
                warn!(topic = %self.name, error = %err, "Failed to load topic");
                self.fail(&err.into());
                return;
            }
        }
        self.status.live();
        debug!(topic = %self.name, last_seq = self.last_seq, "Topic live");

        while let Some(command) = self.receiver.recv().await {
            let flow = match command {
                TopicCommand::Retire { respond_to } => self.retire(respond_to).await,
                TopicCommand::Handoff { respond_to } => {
                    self.handoff(respond_to);
                    Flow::Stop
                }
                other => {
                    self.handle(other).await;
                    Flow::Continue
                }
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }

        self.status.destroyed();
        debug!(topic = %self.name, "Topic stopped");
    }

    /// Loading failed: every queued command gets the error.
    fn fail(&mut self, err: &CourierError) {
        self.status.destroyed();
        self.receiver.close();
        while let Ok(command) = self.receiver.try_recv() {
            command.reject(err);
        }
    }

    async fn handle(&mut self, command: TopicCommand) {
        match command {
            TopicCommand::Request {
                envelope,
                link,
                respond_to,
            } => {
                let result = self.handle_request(envelope, link).await;
                let _ = respond_to.send(result);
            }
            TopicCommand::AwaitLive { respond_to } => {
                let _ = respond_to.send(Ok(Reply::Live));
            }
            TopicCommand::PruneNodes { down } => self.prune_nodes(&down),
            TopicCommand::Relay { .. } => {
                trace!(topic = %self.name, "Ignoring relay on owning node");
            }
            TopicCommand::Retire { respond_to } => {
                let _ = respond_to.send(RetireOutcome::Declined);
            }
            TopicCommand::Handoff { respond_to } => {
                // Only reachable while draining for retirement, which holds the
                // same creation lock as migration.
                let _ = respond_to.send(HandoffState::default());
            }
        }
        self.status.update(self.subscribers.len());
    }

    async fn handle_request(&mut self, envelope: Envelope, link: Option<Link>) -> RouteResult {
        trace!(
            topic = %self.name,
            session = %envelope.session,
            action = envelope.action.name(),
            "Handling request"
        );
        match &envelope.action {
            Action::Subscribe { mode } => {
                let link = link.ok_or_else(|| {
                    CourierError::Internal("subscribe without a delivery link".into())
                })?;
                self.subscribe(&envelope, *mode, link).await
            }
            Action::Leave { unsubscribe } => self.leave(&envelope, *unsubscribe).await,
            Action::Publish { payload } => self.publish(&envelope, payload).await,
            Action::PresenceChange { data } => self.change_presence(&envelope, data.clone()),
            Action::GetInfo => Ok(Reply::Info(self.describe(Some(&envelope.session)))),
            Action::SetInfo { info } => self.set_info(&envelope, info).await,
        }
    }

    async fn subscribe(
        &mut self,
        envelope: &Envelope,
        requested: AccessMode,
        link: Link,
    ) -> RouteResult {
        if self.subscribers.contains_key(&envelope.session) {
            return Ok(Reply::Subscribed(self.describe(Some(&envelope.session))));
        }

        let admission = admit(
            &self.name,
            self.kind,
            &self.members,
            &envelope.identity,
            requested,
        )?;
        if let Some((user, mode)) = &admission.persist {
            self.ctx
                .store
                .save_subscription(&self.name, user, *mode)
                .await?;
            self.members.insert(user.clone(), *mode);
        }

        self.subscribers.insert(
            envelope.session.clone(),
            Subscriber {
                identity: envelope.identity.clone(),
                mode: admission.mode,
                link,
                last_seen: self.last_seq,
            },
        );
        self.presence.join(&envelope.session, &envelope.identity);
        self.status.update(self.subscribers.len());

        debug!(
            topic = %self.name,
            session = %envelope.session,
            mode = %admission.mode,
            subscribers = self.subscribers.len(),
            "Subscribed"
        );

        if let Some(state) = self.presence.get(&envelope.session) {
            let event = state.event(&self.name, PresenceAction::Join);
            self.broadcast(Arc::new(event), None);
        }
        Ok(Reply::Subscribed(self.describe(Some(&envelope.session))))
    }

    async fn leave(&mut self, envelope: &Envelope, unsubscribe: bool) -> RouteResult {
        if !self.subscribers.contains_key(&envelope.session) {
            return Ok(Reply::Left);
        }

        if unsubscribe {
            if let Some(user) = envelope.identity.user_id() {
                if self.members.contains_key(user) {
                    self.ctx.store.delete_subscription(&self.name, user).await?;
                    self.members.remove(user);
                }
            }
        }

        self.subscribers.remove(&envelope.session);
        if let Some(state) = self.presence.leave(&envelope.session) {
            let event = state.event(&self.name, PresenceAction::Leave);
            self.broadcast(Arc::new(event), None);
        }

        debug!(
            topic = %self.name,
            session = %envelope.session,
            unsubscribe,
            subscribers = self.subscribers.len(),
            "Left"
        );
        Ok(Reply::Left)
    }

    async fn publish(&mut self, envelope: &Envelope, payload: &Bytes) -> RouteResult {
        let mode = self
            .subscribers
            .get(&envelope.session)
            .map_or(AccessMode::None, |s| s.mode);
        if !mode.can_write() {
            return Err(CourierError::PermissionDenied(format!(
                "{}: publishing requires write access",
                self.name
            )));
        }

        let seq = self.append(payload).await?;
        self.last_seq = seq;

        let timestamp = now_millis();
        let sender = envelope.identity.user_id();
        let frame = Frame::Data {
            topic: self.name.clone(),
            from: envelope.session.to_string(),
            user: sender.map(|u| u.to_string()),
            seq,
            timestamp,
            payload: payload.to_vec(),
        };
        self.broadcast(Arc::new(frame), Some(seq));
        self.notify_offline(sender, seq, timestamp, payload.len());

        trace!(topic = %self.name, seq, "Published");
        Ok(Reply::Published { seq, timestamp })
    }

    /// Store a message under the next sequence id.
    ///
    /// The previous owner may have appended after this instance loaded
    /// (ownership moves overlap); on a conflict the counter catches up with
    /// the store once.
    async fn append(&mut self, payload: &Bytes) -> Result<u64, CourierError> {
        let seq = self.last_seq + 1;
        match self.ctx.store.append_message(&self.name, seq, payload).await {
            Ok(()) => Ok(seq),
            Err(StoreError::Conflict(reason)) => {
                let record = self.ctx.store.load_topic(&self.name).await?;
                debug!(
                    topic = %self.name,
                    last_seq = self.last_seq,
                    stored = record.last_seq,
                    %reason,
                    "Sequence behind the store, catching up"
                );
                self.last_seq = self.last_seq.max(record.last_seq);
                let seq = self.last_seq + 1;
                self.ctx
                    .store
                    .append_message(&self.name, seq, payload)
                    .await?;
                Ok(seq)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn change_presence(
        &mut self,
        envelope: &Envelope,
        data: Option<serde_json::Value>,
    ) -> RouteResult {
        let state = self
            .presence
            .update(&envelope.session, data)
            .ok_or_else(|| {
                CourierError::PermissionDenied(format!("{}: not subscribed", self.name))
            })?;
        let event = state.event(&self.name, PresenceAction::Update);
        self.broadcast(Arc::new(event), None);
        Ok(Reply::PresenceUpdated)
    }

    async fn set_info(&mut self, envelope: &Envelope, info: &serde_json::Value) -> RouteResult {
        let mode = self
            .subscribers
            .get(&envelope.session)
            .map_or(AccessMode::None, |s| s.mode);
        if !mode.can_admin() {
            return Err(CourierError::PermissionDenied(format!(
                "{}: changing topic info requires admin access",
                self.name
            )));
        }

        self.ctx.store.save_info(&self.name, info).await?;
        self.public = Some(info.clone());

        let frame = Frame::Info {
            id: 0,
            description: self.describe(None),
        };
        self.broadcast(Arc::new(frame), None);
        Ok(Reply::InfoUpdated)
    }

    fn prune_nodes(&mut self, down: &[String]) {
        let gone: Vec<SessionId> = self
            .subscribers
            .iter()
            .filter(|(_, s)| matches!(&s.link, Link::Remote(node) if down.contains(node)))
            .map(|(id, _)| id.clone())
            .collect();
        if gone.is_empty() {
            return;
        }

        for session in &gone {
            self.subscribers.remove(session);
            if let Some(state) = self.presence.leave(session) {
                let event = state.event(&self.name, PresenceAction::Leave);
                self.broadcast(Arc::new(event), None);
            }
        }
        debug!(topic = %self.name, pruned = gone.len(), "Dropped subscribers of down nodes");
    }

    /// Deliver to local sessions directly and once to every proxying node.
    fn broadcast(&mut self, frame: Arc<Frame>, seq: Option<u64>) {
        let mut nodes = BTreeSet::new();
        for (session, subscriber) in &mut self.subscribers {
            match &subscriber.link {
                Link::Local(outbound) => match outbound.deliver(frame.clone()) {
                    Ok(()) => {
                        if let Some(seq) = seq {
                            subscriber.last_seen = seq;
                        }
                    }
                    Err(DeliveryError::Backpressure) => {
                        warn!(topic = %self.name, session = %session, "Session too slow, disconnecting");
                    }
                    Err(DeliveryError::Closed) => {
                        trace!(topic = %self.name, session = %session, "Session already closed");
                    }
                },
                Link::Remote(node) => {
                    nodes.insert(node.clone());
                    if let Some(seq) = seq {
                        subscriber.last_seen = seq;
                    }
                }
            }
        }
        for node in nodes {
            self.ctx.cluster.relay(&node, &self.name, frame.clone());
        }
    }

    fn notify_offline(&self, sender: Option<&UserId>, seq: u64, timestamp: u64, size: usize) {
        let online: BTreeSet<&UserId> = self
            .subscribers
            .values()
            .filter_map(|s| s.identity.user_id())
            .collect();
        let summary = PushSummary {
            topic: self.name.clone(),
            seq,
            from: sender.cloned(),
            timestamp,
            size,
        };
        for user in self.members.keys() {
            if Some(user) != sender && !online.contains(user) {
                self.ctx.push.notify(user, &summary);
            }
        }
    }

    fn describe(&self, requester: Option<&SessionId>) -> TopicDescription {
        let mut subscribers: Vec<SubscriberEntry> = self
            .subscribers
            .iter()
            .map(|(session, s)| SubscriberEntry {
                session: session.to_string(),
                user: s.identity.user_id().map(|u| u.to_string()),
                mode: s.mode,
                last_seen: s.last_seen,
                presence: self.presence.get(session).and_then(|p| p.data.clone()),
            })
            .collect();
        subscribers.sort_by(|a, b| a.session.cmp(&b.session));

        TopicDescription {
            topic: self.name.clone(),
            kind: self.kind,
            mode: requester
                .and_then(|id| self.subscribers.get(id))
                .map_or(AccessMode::None, |s| s.mode),
            last_seq: self.last_seq,
            subscribers,
            public: self.public.clone(),
        }
    }

    /// Retirement handshake: process whatever is already queued, then decide.
    async fn retire(&mut self, respond_to: oneshot::Sender<RetireOutcome>) -> Flow {
        if !self.status.retire_due(Instant::now(), self.ctx.config.grace) {
            let _ = respond_to.send(RetireOutcome::Declined);
            return Flow::Continue;
        }

        self.receiver.close();
        while let Ok(command) = self.receiver.try_recv() {
            self.handle(command).await;
        }

        if self.subscribers.is_empty() {
            debug!(topic = %self.name, last_seq = self.last_seq, "Topic retired");
            let _ = respond_to.send(RetireOutcome::Retired);
            Flow::Stop
        } else {
            let (sender, receiver) = mpsc::channel(self.ctx.config.mailbox.max(1));
            self.receiver = receiver;
            debug!(topic = %self.name, "Topic revived during retirement");
            let _ = respond_to.send(RetireOutcome::Revived(sender));
            Flow::Continue
        }
    }

    fn handoff(&mut self, respond_to: oneshot::Sender<HandoffState>) {
        self.receiver.close();
        let mut leftovers = Vec::new();
        while let Ok(command) = self.receiver.try_recv() {
            leftovers.push(command);
        }

        let members = self
            .subscribers
            .drain()
            .filter_map(|(session, s)| match s.link {
                Link::Local(outbound) => Some(HandoffMember {
                    session,
                    identity: s.identity,
                    mode: s.mode,
                    outbound,
                }),
                Link::Remote(_) => None,
            })
            .collect::<Vec<_>>();

        debug!(
            topic = %self.name,
            members = members.len(),
            queued = leftovers.len(),
            "Topic handed off"
        );
        let _ = respond_to.send(HandoffState { members, leftovers });
    }
}
