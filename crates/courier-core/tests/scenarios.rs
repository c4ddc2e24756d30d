//! Multi-node scenarios over an in-process cluster network.

use async_trait::async_trait;
use bytes::Bytes;
use courier_protocol::cluster::encode_body;
use courier_protocol::{AccessMode, ClusterAction, ClusterFrame, Frame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenvis_courier_core::cluster::LinkError;
use tenvis_courier_core::{
    Action, Cluster, ClusterConfig, ClusterLink, ClusterService, CourierError, Envelope, Hub,
    HubConfig, Identity, MemoryNetwork, MemoryPush, MemoryStore, NodeConfig, NodeHealth, Outbound,
    OutboundReceiver, Reply, SessionId, TopicConfig, TopicRole, TopicStore, TransportKind,
};

const NODES: [&str; 2] = ["n1", "n2"];

/// Delivers route requests but can lose their replies.
struct LossyLink {
    inner: Arc<dyn ClusterLink>,
    to: String,
    drop_replies: Arc<AtomicBool>,
}

#[async_trait]
impl ClusterLink for LossyLink {
    async fn call(&self, frame: ClusterFrame) -> Result<ClusterFrame, LinkError> {
        let route = frame.action == ClusterAction::Route;
        let response = self.inner.call(frame).await?;
        if route && self.drop_replies.load(Ordering::SeqCst) {
            return Err(LinkError::Closed(self.to.clone()));
        }
        Ok(response)
    }
}

struct TestCluster {
    network: Arc<MemoryNetwork>,
    store: Arc<MemoryStore>,
    hubs: HashMap<&'static str, Arc<Hub>>,
    lossy: HashMap<&'static str, Arc<AtomicBool>>,
}

impl TestCluster {
    fn new() -> Self {
        Self::with_topics(TopicConfig::default())
    }

    fn with_topics(topic: TopicConfig) -> Self {
        let network = MemoryNetwork::new();
        let store = Arc::new(MemoryStore::new());
        let mut hubs = HashMap::new();
        let mut lossy = HashMap::new();

        for node in NODES {
            let config = ClusterConfig {
                nodes: NODES
                    .iter()
                    .map(|name| NodeConfig {
                        name: (*name).to_string(),
                        address: format!("{name}.test:7400"),
                    })
                    .collect(),
                rpc_timeout: Duration::from_secs(1),
                rpc_retries: 1,
                retry_backoff: Duration::from_millis(10),
                ..ClusterConfig::standalone(node)
            };
            let drop_replies = Arc::new(AtomicBool::new(false));
            let links: HashMap<String, Arc<dyn ClusterLink>> = NODES
                .iter()
                .filter(|peer| **peer != node)
                .map(|peer| {
                    let link: Arc<dyn ClusterLink> = Arc::new(LossyLink {
                        inner: network.link(node, peer),
                        to: (*peer).to_string(),
                        drop_replies: drop_replies.clone(),
                    });
                    ((*peer).to_string(), link)
                })
                .collect();
            let cluster = Arc::new(Cluster::new(config, links));
            let hub = Hub::new(
                HubConfig {
                    topic: topic.clone(),
                    ..HubConfig::default()
                },
                cluster,
                store.clone() as Arc<dyn TopicStore>,
                Arc::new(MemoryPush::new()),
            );
            let service: Arc<dyn ClusterService> = hub.clone();
            network.attach(node, &service);
            hubs.insert(node, hub);
            lossy.insert(node, drop_replies);
        }

        Self {
            network,
            store,
            hubs,
            lossy,
        }
    }

    fn hub(&self, node: &str) -> &Arc<Hub> {
        &self.hubs[node]
    }

    /// Lose the replies to route requests sent by `node`.
    fn drop_replies_from(&self, node: &str, drop: bool) {
        self.lossy[node].store(drop, Ordering::SeqCst);
    }

    /// First topic with `prefix` owned by `owner`.
    fn topic_owned_by(&self, prefix: &str, owner: &str) -> String {
        let cluster = self.hub(owner).cluster();
        (0..)
            .map(|i| format!("{prefix}{i}"))
            .find(|name| cluster.resolve_owner(name) == owner)
            .unwrap()
    }

    /// Attached subscribers of `topic` on `node` (members plus pending
    /// detaches for a proxy).
    fn load(&self, node: &str, topic: &str) -> Option<usize> {
        self.hub(node).topic(topic).map(|h| h.status().subscribers())
    }
}

fn short_grace() -> TopicConfig {
    TopicConfig {
        grace: Duration::from_millis(10),
        gc_interval: Duration::from_millis(20),
        ..TopicConfig::default()
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting until {what}");
}

fn connect(hub: &Hub, user: &str) -> (SessionId, OutboundReceiver) {
    let (outbound, receiver) = Outbound::channel(64);
    let id = hub
        .connect(Identity::user(user), TransportKind::Streaming, outbound)
        .unwrap();
    (id, receiver)
}

async fn next_data(receiver: &mut OutboundReceiver) -> (u64, Vec<u8>) {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out waiting for data")
            .expect("session closed");
        if let Frame::Data { seq, payload, .. } = frame.as_ref() {
            return (*seq, payload.clone());
        }
    }
}

fn published_seq(reply: Reply) -> u64 {
    match reply {
        Reply::Published { seq, .. } => seq,
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn test_same_node_group_messages() {
    let cluster = TestCluster::new();
    let topic = cluster.topic_owned_by("grp", "n1");
    let hub = cluster.hub("n1");

    let (a, mut a_rx) = connect(hub, "alice");
    let (b, mut b_rx) = connect(hub, "bob");
    hub.join(&a, &topic, AccessMode::Write, 1).await.unwrap();
    hub.join(&b, &topic, AccessMode::Write, 1).await.unwrap();

    let first = hub.publish(&a, &topic, Bytes::from_static(b"P1"), 2).await;
    let second = hub.publish(&b, &topic, Bytes::from_static(b"P2"), 2).await;
    assert_eq!(published_seq(first.unwrap()), 1);
    assert_eq!(published_seq(second.unwrap()), 2);

    for receiver in [&mut a_rx, &mut b_rx] {
        assert_eq!(next_data(receiver).await, (1, b"P1".to_vec()));
        assert_eq!(next_data(receiver).await, (2, b"P2".to_vec()));
    }
}

#[tokio::test]
async fn test_publish_through_proxy() {
    let cluster = TestCluster::new();
    let topic = cluster.topic_owned_by("grp", "n1");
    let owner = cluster.hub("n1");
    let remote = cluster.hub("n2");

    let (a, mut a_rx) = connect(remote, "alice");
    let (b, mut b_rx) = connect(owner, "bob");
    remote.join(&a, &topic, AccessMode::Write, 1).await.unwrap();
    owner.join(&b, &topic, AccessMode::Write, 1).await.unwrap();

    assert!(matches!(
        remote.topic(&topic).unwrap().role(),
        TopicRole::Proxy { owner } if owner == "n1"
    ));
    assert_eq!(*owner.topic(&topic).unwrap().role(), TopicRole::Local);

    let reply = remote
        .publish(&a, &topic, Bytes::from_static(b"hello"), 2)
        .await
        .unwrap();
    assert_eq!(published_seq(reply), 1);

    assert_eq!(next_data(&mut b_rx).await, (1, b"hello".to_vec()));
    assert_eq!(next_data(&mut a_rx).await, (1, b"hello".to_vec()));
    assert_eq!(cluster.store.messages(&topic).len(), 1);
}

#[tokio::test]
async fn test_remote_subscriber_sees_order() {
    let cluster = TestCluster::new();
    let topic = cluster.topic_owned_by("grp", "n1");
    let owner = cluster.hub("n1");
    let remote = cluster.hub("n2");

    let (writer, _w) = connect(owner, "writer");
    let (reader, mut reader_rx) = connect(remote, "reader");
    owner.join(&writer, &topic, AccessMode::Write, 1).await.unwrap();
    remote.join(&reader, &topic, AccessMode::Read, 1).await.unwrap();

    for i in 0..50u64 {
        owner
            .publish(&writer, &topic, Bytes::from(i.to_string()), i + 2)
            .await
            .unwrap();
    }
    for expected in 1..=50 {
        assert_eq!(next_data(&mut reader_rx).await.0, expected);
    }
}

#[tokio::test]
async fn test_owner_down_moves_topic() {
    let cluster = TestCluster::new();
    let topic = cluster.topic_owned_by("dm", "n1");
    let survivor = cluster.hub("n2");

    let (a, _a_rx) = connect(survivor, "alice");
    let (b, mut b_rx) = connect(survivor, "bob");
    survivor.join(&a, &topic, AccessMode::Write, 1).await.unwrap();
    survivor.join(&b, &topic, AccessMode::Write, 1).await.unwrap();

    let reply = survivor
        .publish(&a, &topic, Bytes::from_static(b"before"), 2)
        .await
        .unwrap();
    assert_eq!(published_seq(reply), 1);
    assert_eq!(next_data(&mut b_rx).await.0, 1);

    cluster.network.set_reachable("n1", false);
    survivor.cluster().set_node_health("n1", NodeHealth::Down);
    assert_eq!(survivor.cluster().resolve_owner(&topic), "n2");
    survivor.rebalance().await;

    assert_eq!(*survivor.topic(&topic).unwrap().role(), TopicRole::Local);

    let reply = survivor
        .publish(&a, &topic, Bytes::from_static(b"after"), 3)
        .await
        .unwrap();
    assert_eq!(published_seq(reply), 2);
    assert_eq!(next_data(&mut b_rx).await, (2, b"after".to_vec()));
}

#[tokio::test]
async fn test_unreachable_owner_fails_request() {
    let cluster = TestCluster::new();
    let topic = cluster.topic_owned_by("grp", "n1");
    let remote = cluster.hub("n2");
    let (a, _rx) = connect(remote, "alice");

    cluster.network.set_reachable("n1", false);
    assert!(matches!(
        remote.join(&a, &topic, AccessMode::Write, 1).await,
        Err(CourierError::ClusterUnreachable(_))
    ));
    assert!(remote.sessions().subscriptions(&a).is_empty());
}

#[tokio::test]
async fn test_peer_rejects_request_for_topic_it_does_not_own() {
    let cluster = TestCluster::new();
    let topic = cluster.topic_owned_by("grp", "n1");
    let n2 = cluster.hub("n2");

    let envelope = Envelope::new(
        topic.as_str(),
        SessionId::from("n1-1"),
        Identity::user("alice"),
        1,
        Action::Subscribe {
            mode: AccessMode::Write,
        },
    );
    let request = ClusterFrame::request(
        1,
        "n1",
        "n2",
        ClusterAction::Route,
        topic.as_str(),
        encode_body(&envelope).unwrap(),
    );
    let response = n2.handle(request).await;
    let result: Result<Reply, CourierError> = response.body().unwrap();
    assert!(matches!(result, Err(CourierError::ClusterUnreachable(_))));
    assert!(n2.topic(&topic).is_none());
}

#[tokio::test]
async fn test_load_starts_topic_on_owner() {
    let cluster = TestCluster::new();
    let topic = cluster.topic_owned_by("grp", "n2");
    let n1 = cluster.hub("n1");

    n1.cluster().load("n2", &topic).await.unwrap();
    let handle = cluster.hub("n2").topic(&topic).unwrap();
    assert_eq!(*handle.role(), TopicRole::Local);
}

#[tokio::test]
async fn test_lost_subscribe_reply_does_not_pin_owner_topic() {
    let cluster = TestCluster::with_topics(short_grace());
    let topic = cluster.topic_owned_by("grp", "n1");
    let owner = cluster.hub("n1");
    let remote = cluster.hub("n2");
    let (a, _rx) = connect(remote, "alice");

    // The owner applies the subscribe but n2 never hears back.
    cluster.drop_replies_from("n2", true);
    assert!(matches!(
        remote.join(&a, &topic, AccessMode::Write, 1).await,
        Err(CourierError::ClusterUnreachable(_))
    ));
    assert!(remote.sessions().subscriptions(&a).is_empty());
    remote.disconnect(&a);
    cluster.drop_replies_from("n2", false);

    wait_until("the owner drops the unserved subscriber", || {
        cluster.load("n1", &topic) == Some(0)
    })
    .await;
    wait_until("the proxy confirms the detach", || {
        cluster.load("n2", &topic) == Some(0)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(owner.collect_garbage().await, 1);
    assert!(owner.topic(&topic).is_none());
    assert_eq!(remote.collect_garbage().await, 1);
    assert!(remote.topic(&topic).is_none());
}

#[tokio::test]
async fn test_lost_leave_reply_is_retried() {
    let cluster = TestCluster::with_topics(short_grace());
    let topic = cluster.topic_owned_by("grp", "n1");
    let remote = cluster.hub("n2");
    let (a, _rx) = connect(remote, "alice");
    remote.join(&a, &topic, AccessMode::Write, 1).await.unwrap();
    assert_eq!(cluster.load("n1", &topic), Some(1));

    cluster.drop_replies_from("n2", true);
    assert!(matches!(
        remote.leave(&a, &topic, false, 2).await,
        Err(CourierError::ClusterUnreachable(_))
    ));
    // Still pinned by the unconfirmed detach.
    assert_eq!(cluster.load("n2", &topic), Some(1));

    cluster.drop_replies_from("n2", false);
    wait_until("the owner drops the subscriber", || {
        cluster.load("n1", &topic) == Some(0)
    })
    .await;
    wait_until("the proxy confirms the detach", || {
        cluster.load("n2", &topic) == Some(0)
    })
    .await;
}

#[tokio::test]
async fn test_resubscribe_after_lost_reply_keeps_seat() {
    let cluster = TestCluster::new();
    let topic = cluster.topic_owned_by("grp", "n1");
    let owner = cluster.hub("n1");
    let remote = cluster.hub("n2");
    let (writer, _w) = connect(owner, "writer");
    let (a, mut a_rx) = connect(remote, "alice");
    owner.join(&writer, &topic, AccessMode::Write, 1).await.unwrap();

    cluster.drop_replies_from("n2", true);
    assert!(remote.join(&a, &topic, AccessMode::Read, 1).await.is_err());
    cluster.drop_replies_from("n2", false);
    remote.join(&a, &topic, AccessMode::Read, 2).await.unwrap();

    wait_until("only the resubscribed seat remains", || {
        cluster.load("n1", &topic) == Some(2)
    })
    .await;
    let reply = owner
        .publish(&writer, &topic, Bytes::from_static(b"hi"), 3)
        .await
        .unwrap();
    assert_eq!(published_seq(reply), 1);
    assert_eq!(next_data(&mut a_rx).await, (1, b"hi".to_vec()));
}

#[tokio::test]
async fn test_rejoining_owner_takes_topic_back() {
    let cluster = TestCluster::new();
    let topic = cluster.topic_owned_by("grp", "n2");
    let n1 = cluster.hub("n1");
    let n2 = cluster.hub("n2");

    // While n1 believes n2 is down, it serves the topic itself.
    n1.cluster().set_node_health("n2", NodeHealth::Down);
    let (a, mut a_rx) = connect(n1, "alice");
    n1.join(&a, &topic, AccessMode::Write, 1).await.unwrap();
    let reply = n1
        .publish(&a, &topic, Bytes::from_static(b"P1"), 2)
        .await
        .unwrap();
    assert_eq!(published_seq(reply), 1);
    assert_eq!(*n1.topic(&topic).unwrap().role(), TopicRole::Local);
    assert!(n2.topic(&topic).is_none());

    n1.cluster().set_node_health("n2", NodeHealth::Up);
    n1.rebalance().await;

    // Exactly one authoritative instance, on the ring owner.
    assert!(matches!(
        n1.topic(&topic).unwrap().role(),
        TopicRole::Proxy { owner } if owner == "n2"
    ));
    assert_eq!(*n2.topic(&topic).unwrap().role(), TopicRole::Local);
    // Local members were re-subscribed through the proxy before it returned.
    assert_eq!(cluster.load("n2", &topic), Some(1));
    assert_eq!(cluster.load("n1", &topic), Some(1));

    let reply = n1
        .publish(&a, &topic, Bytes::from_static(b"P2"), 3)
        .await
        .unwrap();
    assert_eq!(published_seq(reply), 2);
    assert_eq!(next_data(&mut a_rx).await, (1, b"P1".to_vec()));
    assert_eq!(next_data(&mut a_rx).await, (2, b"P2".to_vec()));
    assert_eq!(cluster.store.messages(&topic).len(), 2);
}

#[tokio::test]
async fn test_publish_racing_migration_keeps_sequence() {
    let cluster = TestCluster::new();
    let topic = cluster.topic_owned_by("grp", "n2");
    let n1 = cluster.hub("n1");

    n1.cluster().set_node_health("n2", NodeHealth::Down);
    let (a, mut a_rx) = connect(n1, "alice");
    n1.join(&a, &topic, AccessMode::Write, 1).await.unwrap();

    // The publish lands on the old owner, behind the handoff, or on the proxy.
    n1.cluster().set_node_health("n2", NodeHealth::Up);
    let (_, first) = tokio::join!(
        n1.rebalance(),
        n1.publish(&a, &topic, Bytes::from_static(b"moving"), 2)
    );
    assert_eq!(published_seq(first.unwrap()), 1);

    let second = n1
        .publish(&a, &topic, Bytes::from_static(b"moved"), 3)
        .await
        .unwrap();
    assert_eq!(published_seq(second), 2);
    assert_eq!(next_data(&mut a_rx).await, (1, b"moving".to_vec()));
    assert_eq!(next_data(&mut a_rx).await, (2, b"moved".to_vec()));

    let seqs: Vec<u64> = cluster.store.messages(&topic).iter().map(|(seq, _)| *seq).collect();
    assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
async fn test_down_node_subscribers_are_pruned() {
    let cluster = TestCluster::new();
    let topic = cluster.topic_owned_by("grp", "n1");
    let owner = cluster.hub("n1");
    let remote = cluster.hub("n2");

    let (a, _a_rx) = connect(owner, "alice");
    let (b, _b_rx) = connect(remote, "bob");
    owner.join(&a, &topic, AccessMode::Write, 1).await.unwrap();
    remote.join(&b, &topic, AccessMode::Write, 1).await.unwrap();
    assert_eq!(cluster.load("n1", &topic), Some(2));

    cluster.network.set_reachable("n2", false);
    owner.cluster().set_node_health("n2", NodeHealth::Down);
    owner.rebalance().await;

    let Reply::Info(description) = owner.get_info(&a, &topic, 2).await.unwrap() else {
        panic!("expected info");
    };
    assert_eq!(description.subscribers.len(), 1);
    assert_eq!(description.subscribers[0].session, a.to_string());
    assert_eq!(*owner.topic(&topic).unwrap().role(), TopicRole::Local);
}
