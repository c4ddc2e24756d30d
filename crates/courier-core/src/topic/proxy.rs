//! Proxy topic: local stand-in for a topic owned by another node.
//!
//! A subscribe or leave whose reply is lost may still have reached the
//! owner. Such sessions are kept as detached until the owner confirms a
//! leave, so the owner never keeps a subscriber nobody here serves.

use courier_protocol::{AccessMode, Frame};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::{
    HandoffMember, HandoffState, Link, RetireOutcome, TopicCommand, TopicContext, TopicStatus,
};
use crate::error::CourierError;
use crate::message::{Action, Envelope, Reply, RouteResult};
use crate::session::{Identity, Outbound, SessionId};

#[derive(Debug)]
struct Member {
    identity: Identity,
    mode: AccessMode,
    outbound: Outbound,
}

enum PendingKind {
    /// A client request waiting for the owner's reply.
    Request {
        respond_to: oneshot::Sender<RouteResult>,
        /// The member was added when the subscribe was forwarded.
        joined: bool,
        /// Identity to detach with if the owner may have applied the
        /// request without answering.
        detach_as: Option<Identity>,
    },
    /// A leave sent on behalf of a detached session.
    Detach,
}

struct Pending {
    session: SessionId,
    kind: PendingKind,
}

/// A session the owner may still count as subscribed.
struct Detached {
    identity: Identity,
    in_flight: bool,
}

/// A subscribe held back until the session's detach completes.
struct Deferred {
    envelope: Envelope,
    link: Option<Link>,
    respond_to: oneshot::Sender<RouteResult>,
}

struct Completion {
    id: u64,
    result: RouteResult,
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct ProxyActor {
    name: String,
    owner: String,
    ctx: Arc<TopicContext>,
    receiver: mpsc::Receiver<TopicCommand>,
    status: Arc<TopicStatus>,
    members: HashMap<SessionId, Member>,
    pending: HashMap<u64, Pending>,
    detached: HashMap<SessionId, Detached>,
    deferred: Vec<Deferred>,
    next_id: u64,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
}

impl ProxyActor {
    pub(crate) fn new(
        name: &str,
        owner: &str,
        ctx: Arc<TopicContext>,
        receiver: mpsc::Receiver<TopicCommand>,
        status: Arc<TopicStatus>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            ctx,
            receiver,
            status,
            members: HashMap::new(),
            pending: HashMap::new(),
            detached: HashMap::new(),
            deferred: Vec::new(),
            next_id: 1,
            completions_tx,
            completions_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        self.status.live();
        debug!(topic = %self.name, owner = %self.owner, "Proxy topic started");

        let mut retry = tokio::time::interval(self.ctx.config.gc_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(done) = self.completions_rx.recv() => self.complete(done),
                _ = retry.tick(), if !self.detached.is_empty() => self.retry_detached(),
                command = self.receiver.recv() => {
                    let Some(command) = command else { break };
                    let flow = match command {
                        TopicCommand::Retire { respond_to } => self.retire(respond_to),
                        TopicCommand::Handoff { respond_to } => {
                            self.handoff(respond_to).await;
                            Flow::Stop
                        }
                        other => {
                            self.handle(other);
                            Flow::Continue
                        }
                    };
                    if matches!(flow, Flow::Stop) {
                        break;
                    }
                }
            }
        }

        self.status.destroyed();
        debug!(topic = %self.name, "Proxy topic stopped");
    }

    fn refresh(&self) {
        let load = self.members.len() + self.detached.len();
        let load = if self.pending.is_empty() {
            load
        } else {
            load.max(1)
        };
        self.status.update(load);
    }

    fn handle(&mut self, command: TopicCommand) {
        match command {
            TopicCommand::Request {
                envelope,
                link,
                respond_to,
            } => self.forward(envelope, link, respond_to),
            TopicCommand::Relay { frame } => self.relay(&frame),
            TopicCommand::AwaitLive { respond_to } => {
                let _ = respond_to.send(Ok(Reply::Live));
            }
            TopicCommand::PruneNodes { .. } => {}
            TopicCommand::Retire { respond_to } => {
                let _ = respond_to.send(RetireOutcome::Declined);
            }
            TopicCommand::Handoff { respond_to } => {
                let _ = respond_to.send(HandoffState::default());
            }
        }
        self.refresh();
    }

    fn forward(
        &mut self,
        envelope: Envelope,
        link: Option<Link>,
        respond_to: oneshot::Sender<RouteResult>,
    ) {
        let detaching = self
            .detached
            .get(&envelope.session)
            .is_some_and(|d| d.in_flight);
        if detaching && matches!(envelope.action, Action::Subscribe { .. }) {
            // Must not overtake the leave already on its way.
            self.deferred.push(Deferred {
                envelope,
                link,
                respond_to,
            });
            return;
        }

        let mut joined = false;
        let mut detach_as = None;
        match (&envelope.action, link) {
            (Action::Subscribe { mode }, Some(Link::Local(outbound))) => {
                // Subscribing again makes a leftover seat on the owner legitimate.
                self.detached.remove(&envelope.session);
                if !self.members.contains_key(&envelope.session) {
                    self.members.insert(
                        envelope.session.clone(),
                        Member {
                            identity: envelope.identity.clone(),
                            mode: *mode,
                            outbound,
                        },
                    );
                    joined = true;
                    detach_as = Some(envelope.identity.clone());
                }
            }
            (Action::Subscribe { .. }, _) => {
                let _ = respond_to.send(Err(CourierError::Internal(
                    "proxy subscribe needs a local session".into(),
                )));
                return;
            }
            (Action::Leave { .. }, _) => {
                self.members.remove(&envelope.session);
                detach_as = Some(envelope.identity.clone());
            }
            _ => {}
        }

        let session = envelope.session.clone();
        self.send(
            envelope,
            Pending {
                session,
                kind: PendingKind::Request {
                    respond_to,
                    joined,
                    detach_as,
                },
            },
        );
    }

    fn send(&mut self, envelope: Envelope, pending: Pending) {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, pending);

        trace!(
            topic = %self.name,
            owner = %self.owner,
            action = envelope.action.name(),
            "Forwarding request"
        );

        let cluster = self.ctx.cluster.clone();
        let owner = self.owner.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = cluster.forward(&envelope, &owner).await;
            let _ = completions.send(Completion { id, result });
        });
    }

    fn complete(&mut self, done: Completion) {
        let Some(pending) = self.pending.remove(&done.id) else {
            return;
        };
        let session = pending.session;
        match pending.kind {
            PendingKind::Detach => self.finish_detach(session, &done.result),
            PendingKind::Request {
                respond_to,
                joined,
                detach_as,
            } => {
                match &done.result {
                    Ok(Reply::Subscribed(description)) => {
                        if let Some(member) = self.members.get_mut(&session) {
                            member.mode = description.mode;
                        }
                    }
                    Err(err) => {
                        if joined {
                            debug!(topic = %self.name, session = %session, error = %err, "Remote subscribe failed");
                            self.members.remove(&session);
                        }
                        let unanswered = matches!(err, CourierError::ClusterUnreachable(_));
                        if let Some(identity) = detach_as.filter(|_| unanswered) {
                            if !self.members.contains_key(&session) {
                                self.detach(session, identity);
                            }
                        }
                    }
                    Ok(_) => {}
                }
                let _ = respond_to.send(done.result);
            }
        }
        self.refresh();
    }

    /// Tell the owner to drop `session`, which this node no longer serves.
    fn detach(&mut self, session: SessionId, identity: Identity) {
        debug!(topic = %self.name, session = %session, owner = %self.owner, "Detaching session from owner");
        self.detached.insert(
            session.clone(),
            Detached {
                identity,
                in_flight: false,
            },
        );
        self.send_detach(&session);
    }

    fn send_detach(&mut self, session: &SessionId) {
        let Some(detached) = self.detached.get_mut(session) else {
            return;
        };
        detached.in_flight = true;
        let envelope = Envelope::new(
            self.name.as_str(),
            session.clone(),
            detached.identity.clone(),
            0,
            Action::Leave { unsubscribe: false },
        );
        self.send(
            envelope,
            Pending {
                session: session.clone(),
                kind: PendingKind::Detach,
            },
        );
    }

    fn finish_detach(&mut self, session: SessionId, result: &RouteResult) {
        match result {
            Ok(_) => {
                trace!(topic = %self.name, session = %session, "Session detached from owner");
                self.detached.remove(&session);
            }
            Err(err) => {
                debug!(topic = %self.name, session = %session, error = %err, "Detach failed, will retry");
                if let Some(detached) = self.detached.get_mut(&session) {
                    detached.in_flight = false;
                }
            }
        }

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|d| d.envelope.session == session);
        self.deferred = waiting;
        for deferred in ready {
            self.forward(deferred.envelope, deferred.link, deferred.respond_to);
        }
    }

    fn retry_detached(&mut self) {
        let idle: Vec<SessionId> = self
            .detached
            .iter()
            .filter(|(_, d)| !d.in_flight)
            .map(|(session, _)| session.clone())
            .collect();
        for session in idle {
            self.send_detach(&session);
        }
        self.refresh();
    }

    fn relay(&self, frame: &Arc<Frame>) {
        for (session, member) in &self.members {
            if let Err(err) = member.outbound.deliver(frame.clone()) {
                trace!(topic = %self.name, session = %session, error = %err, "Relay delivery failed");
            }
        }
    }

    fn retire(&mut self, respond_to: oneshot::Sender<RetireOutcome>) -> Flow {
        if !self.status.retire_due(Instant::now(), self.ctx.config.grace) {
            let _ = respond_to.send(RetireOutcome::Declined);
            return Flow::Continue;
        }

        self.receiver.close();
        while let Ok(command) = self.receiver.try_recv() {
            self.handle(command);
        }

        if self.members.is_empty() && self.pending.is_empty() && self.detached.is_empty() {
            let _ = respond_to.send(RetireOutcome::Retired);
            Flow::Stop
        } else {
            let (sender, receiver) = mpsc::channel(self.ctx.config.mailbox.max(1));
            self.receiver = receiver;
            let _ = respond_to.send(RetireOutcome::Revived(sender));
            Flow::Continue
        }
    }

    async fn handoff(&mut self, respond_to: oneshot::Sender<HandoffState>) {
        self.receiver.close();
        let mut leftovers = Vec::new();
        while let Ok(command) = self.receiver.try_recv() {
            leftovers.push(command);
        }

        // Forwards in flight finish (or time out) before the members move on.
        while !self.pending.is_empty() {
            match self.completions_rx.recv().await {
                Some(done) => self.complete(done),
                None => break,
            }
        }
        if !self.pending.is_empty() {
            warn!(topic = %self.name, pending = self.pending.len(), "Dropping unanswered forwards");
        }
        if !self.detached.is_empty() {
            // The old owner drops its remote subscribers when it hands over.
            debug!(topic = %self.name, detached = self.detached.len(), "Abandoning detaches");
            self.detached.clear();
        }

        let members = self
            .members
            .drain()
            .map(|(session, m)| HandoffMember {
                session,
                identity: m.identity,
                mode: m.mode,
                outbound: m.outbound,
            })
            .collect::<Vec<_>>();

        debug!(
            topic = %self.name,
            owner = %self.owner,
            members = members.len(),
            queued = leftovers.len(),
            "Proxy topic handed off"
        );
        let _ = respond_to.send(HandoffState { members, leftovers });
    }
}
