//! In-process connections.
//!
//! A [`MemoryConnection`] is the server end of a pair of channels; the
//! [`MemoryClient`] is the client end. Used by tests and embedders that
//! run a node in the same process as its clients.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use courier_protocol::{codec, Frame};
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, FrameReceiver, FrameSender, TransportError};

/// Server end of an in-process connection.
pub struct MemoryConnection {
    id: ConnectionId,
    reconnect_prone: bool,
    incoming: mpsc::Receiver<Frame>,
    outgoing: mpsc::Sender<Frame>,
}

/// Client end of an in-process connection.
pub struct MemoryClient {
    outgoing: mpsc::Sender<Frame>,
    incoming: mpsc::Receiver<Frame>,
}

impl MemoryConnection {
    /// Create a connected pair with `capacity` frames of buffering each way.
    ///
    /// `reconnect_prone` marks the connection as long-poll style.
    #[must_use]
    pub fn pair(capacity: usize, reconnect_prone: bool) -> (MemoryConnection, MemoryClient) {
        let (to_server, incoming) = mpsc::channel(capacity.max(1));
        let (outgoing, to_client) = mpsc::channel(capacity.max(1));
        (
            MemoryConnection {
                id: ConnectionId::generate(),
                reconnect_prone,
                incoming,
                outgoing,
            },
            MemoryClient {
                outgoing: to_server,
                incoming: to_client,
            },
        )
    }
}

impl MemoryClient {
    /// Send a frame to the server.
    ///
    /// # Errors
    ///
    /// Fails once the server end is gone.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Next frame from the server, `None` once the server closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }
}

async fn push(outgoing: &mpsc::Sender<Frame>, frame: Frame) -> Result<(), TransportError> {
    outgoing
        .send(frame)
        .await
        .map_err(|_| TransportError::ConnectionClosed)
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn name(&self) -> &'static str {
        if self.reconnect_prone {
            "memory-poll"
        } else {
            "memory"
        }
    }

    fn reconnect_prone(&self) -> bool {
        self.reconnect_prone
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.incoming.recv().await)
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        push(&self.outgoing, frame.clone()).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.incoming.close();
        Ok(())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        (
            Box::new(MemorySender {
                outgoing: Some(self.outgoing),
            }),
            Box::new(MemoryReceiver {
                incoming: self.incoming,
            }),
        )
    }
}

struct MemorySender {
    outgoing: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSender for MemorySender {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        match &self.outgoing {
            Some(outgoing) => push(outgoing, frame.clone()).await,
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        let mut buf = BytesMut::from(data.as_ref());
        while let Some(frame) = codec::decode_from::<Frame>(&mut buf)? {
            self.send(&frame).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the sender ends the client's stream.
        self.outgoing = None;
        Ok(())
    }
}

struct MemoryReceiver {
    incoming: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.incoming.recv().await)
    }
}
