//! Per-connection session pump.
//!
//! A connection must open with a `connect` frame. After the handshake the
//! connection is split: the reader hands requests to a sequential worker
//! that calls into the hub, and a writer drains the session's outbound queue
//! (replies and broadcasts alike) into the transport.

use bytes::Bytes;
use courier_protocol::{codec, Frame, PROTOCOL_VERSION};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenvis_courier_core::{
    CourierError, Hub, Identity, Outbound, OutboundReceiver, SessionId, TransportKind,
};
use tenvis_courier_transport::{Connection, FrameReceiver, FrameSender, TransportError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::handlers::AppState;
use crate::metrics::{self, ConnectionMetricsGuard};

/// Requests read ahead of the worker.
const REQUEST_QUEUE: usize = 64;

/// Holds one connection slot until dropped.
struct ConnectionSlot<'a> {
    state: &'a AppState,
}

impl<'a> ConnectionSlot<'a> {
    fn acquire(state: &'a AppState) -> Option<Self> {
        let active = state.connections.fetch_add(1, Ordering::AcqRel);
        let slot = Self { state };
        (active < state.config.limits.max_connections).then_some(slot)
    }
}

impl Drop for ConnectionSlot<'_> {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Serve one client connection until it closes or its session is evicted.
pub async fn serve_connection(state: Arc<AppState>, mut conn: Box<dyn Connection>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection = conn.id().clone();

    let Some(_slot) = ConnectionSlot::acquire(&state) else {
        warn!(connection = %connection, "Connection limit reached");
        let err = CourierError::LimitReached("too many connections".into());
        refuse(conn, err.to_frame(0)).await;
        return;
    };

    let (identity, version) = match handshake(&state, conn.as_mut()).await {
        Ok(accepted) => accepted,
        Err(frame) => {
            debug!(connection = %connection, "Handshake refused");
            refuse(conn, frame).await;
            return;
        }
    };

    let transport = if conn.reconnect_prone() {
        TransportKind::LongPoll
    } else {
        TransportKind::Streaming
    };
    let capacity = state.hub.sessions().config().outbound_capacity;
    let (outbound, outbound_rx) = Outbound::channel(capacity);
    let session = match state.hub.connect(identity, transport, outbound.clone()) {
        Ok(session) => session,
        Err(err) => {
            refuse(conn, err.to_frame(0)).await;
            return;
        }
    };

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(session.as_str(), version, heartbeat);
    if let Err(e) = conn.send(&connected).await {
        debug!(session = %session, error = %e, "Failed to send connected frame");
        state.hub.disconnect(&session);
        return;
    }
    info!(
        session = %session,
        connection = %connection,
        transport = conn.name(),
        remote = ?conn.remote_addr(),
        "Session started"
    );

    let (sender, receiver) = conn.split();
    let writer = tokio::spawn(write_outbound(sender, outbound_rx));
    let (requests, queue) = mpsc::channel(REQUEST_QUEUE);
    let worker = tokio::spawn(process_requests(
        Arc::clone(&state.hub),
        session.clone(),
        outbound.clone(),
        queue,
    ));

    read_frames(&session, &outbound, receiver, requests).await;

    state.hub.disconnect(&session);
    outbound.close();
    let _ = worker.await;
    let _ = writer.await;
    debug!(session = %session, "Session ended");
}

/// Wait for `connect`, check the version and authenticate.
async fn handshake(
    state: &AppState,
    conn: &mut dyn Connection,
) -> Result<(Identity, u8), Frame> {
    let timeout = Duration::from_millis(state.config.transport.handshake_timeout_ms);
    let first = tokio::time::timeout(timeout, conn.recv())
        .await
        .map_err(|_| Frame::error(0, 408, "connect frame not received in time"))?;

    let (version, token) = match first {
        Ok(Some(Frame::Connect { version, token })) => (version, token),
        Ok(Some(other)) => {
            let err = CourierError::Protocol(format!(
                "expected connect, got {:?}",
                other.frame_type()
            ));
            return Err(err.to_frame(0));
        }
        Ok(None) => return Err(Frame::error(0, 400, "connection closed")),
        Err(e) => return Err(CourierError::Protocol(e.to_string()).to_frame(0)),
    };

    let version = PROTOCOL_VERSION.negotiate(version).ok_or_else(|| {
        let err = CourierError::Protocol(format!(
            "unsupported protocol version {version}, server speaks {PROTOCOL_VERSION}"
        ));
        err.to_frame(0)
    })?;
    let identity = state
        .auth
        .authenticate(token.as_deref())
        .map_err(|e| CourierError::PermissionDenied(e.to_string()).to_frame(0))?;
    Ok((identity, version))
}

async fn refuse(mut conn: Box<dyn Connection>, frame: Frame) {
    if let Frame::Error { code, .. } = &frame {
        metrics::record_error(*code);
    }
    let _ = conn.send(&frame).await;
    let _ = conn.close().await;
}

async fn read_frames(
    session: &SessionId,
    outbound: &Outbound,
    mut receiver: Box<dyn FrameReceiver>,
    requests: mpsc::Sender<Frame>,
) {
    loop {
        let received = tokio::select! {
            () = outbound.closed() => {
                debug!(session = %session, "Session closed by node");
                return;
            }
            received = receiver.recv() => received,
        };

        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(session = %session, "Client closed connection");
                return;
            }
            Err(TransportError::MessageTooLarge { size, limit }) => {
                let err = CourierError::Protocol(format!(
                    "message of {size} bytes exceeds limit of {limit}"
                ));
                metrics::record_error(err.code());
                let _ = outbound.deliver(Arc::new(err.to_frame(0)));
                continue;
            }
            Err(TransportError::Protocol(e)) => {
                // The stream cannot be resynchronised after a bad frame.
                warn!(session = %session, error = %e, "Malformed frame");
                let err = CourierError::Protocol(e.to_string());
                metrics::record_error(err.code());
                let _ = outbound.deliver(Arc::new(err.to_frame(0)));
                return;
            }
            Err(e) => {
                debug!(session = %session, error = %e, "Connection read failed");
                return;
            }
        };

        if let Frame::Connect { .. } = frame {
            let err = CourierError::Protocol("already connected".into());
            let _ = outbound.deliver(Arc::new(err.to_frame(0)));
            continue;
        }
        trace!(session = %session, frame_type = ?frame.frame_type(), "Request");
        if requests.send(frame).await.is_err() {
            return;
        }
    }
}

/// Serve requests of one session in arrival order.
async fn process_requests(
    hub: Arc<Hub>,
    session: SessionId,
    outbound: Outbound,
    mut queue: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = queue.recv().await {
        let start = Instant::now();
        let Some(reply) = hub.handle_frame(&session, frame).await else {
            continue;
        };
        metrics::record_latency(start.elapsed().as_secs_f64());
        if let Frame::Error { code, .. } = &reply {
            metrics::record_error(*code);
        }
        if outbound.deliver(Arc::new(reply)).is_err() {
            break;
        }
    }
}

async fn write_outbound(mut sender: Box<dyn FrameSender>, mut outbound: OutboundReceiver) {
    while let Some(frame) = outbound.recv().await {
        let data: Bytes = match codec::encode(frame.as_ref()) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                continue;
            }
        };
        metrics::record_message(data.len(), "outbound");
        if let Err(e) = sender.send_raw(data).await {
            debug!(error = %e, "Connection write failed");
            break;
        }
    }
    // Dropping the receiver closes the session, which stops the reader.
    drop(outbound);
    let _ = sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenAuthenticator;
    use crate::config::{AuthConfig, Config};
    use courier_protocol::AccessMode;
    use tenvis_courier_core::{Cluster, MemoryStore, NoopPush};
    use tenvis_courier_transport::{MemoryClient, MemoryConnection};

    fn state(config: Config) -> Arc<AppState> {
        let hub = Hub::new(
            config.hub_config(),
            Arc::new(Cluster::standalone("n1")),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopPush),
        );
        let auth = Arc::new(TokenAuthenticator::new(&config.auth));
        Arc::new(AppState::new(config, hub, auth))
    }

    async fn open(state: &Arc<AppState>, token: Option<&str>) -> (MemoryClient, Option<Frame>) {
        let (server, mut client) = MemoryConnection::pair(16, false);
        tokio::spawn(serve_connection(Arc::clone(state), Box::new(server)));
        client
            .send(Frame::connect(1, token.map(str::to_string)))
            .await
            .unwrap();
        let reply = client.recv().await;
        (client, reply)
    }

    async fn next_reply(client: &mut MemoryClient) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .expect("timed out")
            .expect("connection closed")
    }

    #[tokio::test]
    async fn test_handshake_and_publish() {
        let state = state(Config::default());
        let (mut client, reply) = open(&state, Some("alice")).await;
        assert!(matches!(reply, Some(Frame::Connected { version: 1, .. })));

        client
            .send(Frame::subscribe(1, "grp1", AccessMode::Write))
            .await
            .unwrap();
        // The reply and the session's own join event, in either order.
        let mut frames = vec![next_reply(&mut client).await, next_reply(&mut client).await];
        frames.sort_by_key(|f| matches!(f, Frame::Info { .. }));
        assert!(matches!(frames[0], Frame::PresenceEvent { .. }));
        assert!(matches!(frames[1], Frame::Info { id: 1, .. }));

        client
            .send(Frame::publish(2, "grp1", b"P1".to_vec()))
            .await
            .unwrap();
        let mut seen_ack = false;
        let mut seen_data = false;
        while !(seen_ack && seen_data) {
            match next_reply(&mut client).await {
                Frame::Ack { id: 2, seq, .. } => {
                    assert_eq!(seq, Some(1));
                    seen_ack = true;
                }
                Frame::Data { seq, payload, .. } => {
                    assert_eq!((seq, payload), (1, b"P1".to_vec()));
                    seen_data = true;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_refuses_missing_token() {
        let state = state(Config::default());
        let (mut client, reply) = open(&state, None).await;
        assert!(matches!(reply, Some(Frame::Error { code: 403, .. })));
        assert_eq!(client.recv().await, None);
        assert_eq!(state.hub.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_anonymous_allowed_when_configured() {
        let config = Config {
            auth: AuthConfig {
                allow_anonymous: true,
                ..AuthConfig::default()
            },
            ..Config::default()
        };
        let state = state(config);
        let (_client, reply) = open(&state, None).await;
        assert!(matches!(reply, Some(Frame::Connected { .. })));
    }

    #[tokio::test]
    async fn test_first_frame_must_be_connect() {
        let state = state(Config::default());
        let (server, mut client) = MemoryConnection::pair(16, false);
        tokio::spawn(serve_connection(Arc::clone(&state), Box::new(server)));

        client.send(Frame::ping()).await.unwrap();
        assert!(matches!(
            client.recv().await,
            Some(Frame::Error { code: 400, .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_releases_session() {
        let state = state(Config::default());
        let (client, _) = open(&state, Some("alice")).await;
        assert_eq!(state.hub.stats().sessions, 1);

        drop(client);
        for _ in 0..100 {
            if state.hub.stats().sessions == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.hub.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let state = state(config);

        let (_first, reply) = open(&state, Some("alice")).await;
        assert!(matches!(reply, Some(Frame::Connected { .. })));
        let (_second, reply) = open(&state, Some("bob")).await;
        assert!(matches!(reply, Some(Frame::Error { code: 429, .. })));
    }
}
