//! TCP cluster links.
//!
//! One connection per peer carries length-prefixed MessagePack
//! [`ClusterFrame`]s in both directions. Requests are multiplexed by
//! correlation id; the connection is (re)established on demand.

use async_trait::async_trait;
use bytes::BytesMut;
use courier_protocol::{codec, ClusterAction, ClusterFrame};
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::link::{ClusterLink, ClusterService, LinkError};

const WRITE_QUEUE: usize = 1024;
const READ_BUFFER: usize = 8 * 1024;

type Pending = Arc<DashMap<u64, oneshot::Sender<ClusterFrame>>>;

/// One TCP connection; its waiters fail when it drops.
#[derive(Clone)]
struct Connection {
    writer: mpsc::Sender<ClusterFrame>,
    pending: Pending,
    alive: CancellationToken,
}

/// Client side of a link to one peer.
pub struct TcpLink {
    node: String,
    address: String,
    connection: Mutex<Option<Connection>>,
}

/// Removes a pending entry when the call is abandoned (timeout or error).
struct PendingGuard {
    pending: Pending,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl TcpLink {
    /// Link to `node`, listening on `address`.
    #[must_use]
    pub fn new(node: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            address: address.into(),
            connection: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<Connection, LinkError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.alive.is_cancelled() {
                return Ok(conn.clone());
            }
        }

        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| LinkError::Unreachable(format!("{} ({}): {e}", self.node, self.address)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(node = %self.node, error = %e, "Failed to set TCP_NODELAY");
        }
        debug!(node = %self.node, address = %self.address, "Cluster link connected");

        let (read, write) = stream.into_split();
        let (writer, queue) = mpsc::channel(WRITE_QUEUE);
        let conn = Connection {
            writer,
            pending: Arc::new(DashMap::new()),
            alive: CancellationToken::new(),
        };
        tokio::spawn(write_frames(write, queue, conn.alive.clone()));
        tokio::spawn(read_responses(
            read,
            conn.pending.clone(),
            conn.alive.clone(),
            self.node.clone(),
        ));

        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl ClusterLink for TcpLink {
    async fn call(&self, frame: ClusterFrame) -> Result<ClusterFrame, LinkError> {
        let conn = self.connection().await?;
        let id = frame.correlation_id;
        let (tx, rx) = oneshot::channel();
        conn.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: conn.pending.clone(),
            id,
        };

        conn.writer
            .send(frame)
            .await
            .map_err(|_| LinkError::Closed(self.node.clone()))?;
        rx.await.map_err(|_| LinkError::Closed(self.node.clone()))
    }
}

async fn write_frames(
    mut write: OwnedWriteHalf,
    mut queue: mpsc::Receiver<ClusterFrame>,
    alive: CancellationToken,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    loop {
        let frame = tokio::select! {
            () = alive.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        buf.clear();
        if let Err(e) = codec::encode_into(&frame, &mut buf) {
            warn!(error = %e, "Failed to encode cluster frame");
            continue;
        }
        if let Err(e) = write.write_all(&buf).await {
            debug!(error = %e, "Cluster link write failed");
            break;
        }
    }
    alive.cancel();
}

async fn read_responses(
    mut read: OwnedReadHalf,
    pending: Pending,
    alive: CancellationToken,
    node: String,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    let result: io::Result<()> = async {
        loop {
            while let Some(frame) = codec::decode_from::<ClusterFrame>(&mut buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            {
                match pending.remove(&frame.correlation_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(frame);
                    }
                    None => trace!(correlation_id = frame.correlation_id, "Late cluster response"),
                }
            }
            let n = tokio::select! {
                () = alive.cancelled() => return Ok(()),
                n = read.read_buf(&mut buf) => n?,
            };
            if n == 0 {
                return Ok(());
            }
        }
    }
    .await;

    if let Err(e) = result {
        debug!(node = %node, error = %e, "Cluster link read failed");
    }
    alive.cancel();
    // Only waiters of this connection; a replacement has its own map.
    pending.clear();
    debug!(node = %node, "Cluster link disconnected");
}

/// Accept peer connections and answer their requests until `shutdown` fires.
///
/// Relay requests are handled in arrival order on each connection; every
/// other request runs concurrently.
pub async fn serve(
    listener: TcpListener,
    service: Arc<dyn ClusterService>,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("Cluster listener on {}", addr);
    }
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "Peer connected");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                }
                tokio::spawn(serve_connection(
                    stream,
                    service.clone(),
                    shutdown.child_token(),
                ));
            }
            Err(e) => warn!(error = %e, "Failed to accept peer connection"),
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    service: Arc<dyn ClusterService>,
    alive: CancellationToken,
) {
    let (mut read, write) = stream.into_split();
    let (responses, queue) = mpsc::channel(WRITE_QUEUE);
    tokio::spawn(write_frames(write, queue, alive.clone()));

    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    loop {
        loop {
            let frame = match codec::decode_from::<ClusterFrame>(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Invalid frame from peer");
                    alive.cancel();
                    return;
                }
            };
            if !frame.is_request() {
                continue;
            }
            if frame.action == ClusterAction::Relay {
                let response = service.handle(frame).await;
                let _ = responses.send(response).await;
            } else {
                let service = service.clone();
                let responses = responses.clone();
                tokio::spawn(async move {
                    let response = service.handle(frame).await;
                    let _ = responses.send(response).await;
                });
            }
        }

        let received = tokio::select! {
            () = alive.cancelled() => break,
            n = read.read_buf(&mut buf) => n,
        };
        match received {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Peer connection read failed");
                break;
            }
        }
    }
    alive.cancel();
}
