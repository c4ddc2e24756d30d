//! WebSocket transport implementation.
//!
//! Wraps a WebSocket upgraded by axum. Each binary message carries one or
//! more length-prefixed frames; text messages are accepted as binary.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::{Bytes, BytesMut};
use courier_protocol::{codec, Frame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, FrameReceiver, FrameSender, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// Accumulates message bytes and yields complete frames.
struct FrameBuffer {
    buffer: BytesMut,
    max_message_size: usize,
}

impl FrameBuffer {
    fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_message_size,
        }
    }

    async fn read<S>(&mut self, stream: &mut S) -> Result<Option<Frame>, TransportError>
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
    {
        loop {
            if let Some(frame) = codec::decode_from(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let data = match stream.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                // Pings are answered by the WebSocket layer.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket error");
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            };

            if data.len() > self.max_message_size {
                warn!(
                    size = data.len(),
                    max = self.max_message_size,
                    "Message too large"
                );
                return Err(TransportError::MessageTooLarge {
                    size: data.len(),
                    limit: self.max_message_size,
                });
            }
            self.buffer.extend_from_slice(&data);
        }
    }
}

async fn send_binary<S>(sink: &mut S, data: Bytes) -> Result<(), TransportError>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin + Send,
{
    sink.send(Message::Binary(data.to_vec()))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

async fn close_sink<S>(sink: &mut S) -> Result<(), TransportError>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin + Send,
{
    // The peer may already be gone; the close frame is best effort.
    let _ = sink.send(Message::Close(None)).await;
    sink.close()
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

/// A WebSocket client connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    reader: FrameBuffer,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>, config: &WebSocketConfig) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr,
            reader: FrameBuffer::new(config.max_message_size),
        }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        self.reader.read(&mut self.socket).await
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        send_binary(&mut self.socket, codec::encode(frame)?).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        close_sink(&mut self.socket).await
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(WebSocketSender { sink }),
            Box::new(WebSocketReceiver {
                stream,
                reader: self.reader,
            }),
        )
    }
}

/// Sending half of a [`WebSocketConnection`].
pub struct WebSocketSender {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSender for WebSocketSender {
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        send_binary(&mut self.sink, data).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        close_sink(&mut self.sink).await
    }
}

/// Receiving half of a [`WebSocketConnection`].
pub struct WebSocketReceiver {
    stream: SplitStream<WebSocket>,
    reader: FrameBuffer,
}

#[async_trait]
impl FrameReceiver for WebSocketReceiver {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        self.reader.read(&mut self.stream).await
    }
}
