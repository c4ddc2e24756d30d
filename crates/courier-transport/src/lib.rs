//! # courier-transport
//!
//! Client transport abstraction for the Courier messaging engine.
//!
//! A transport delivers protocol frames between one client and a node:
//!
//! - **WebSocket** - Streaming transport served through axum
//! - **Memory** - In-process pair, streaming or long-poll flavoured, for tests
//!
//! ## Transport Abstraction
//!
//! Every transport implements [`Connection`]. The server performs the
//! handshake on the whole connection, then splits it so reading and
//! writing proceed independently.
//!
//! ```rust,ignore
//! use courier_transport::Connection;
//!
//! async fn handle_connection(conn: Box<dyn Connection>) {
//!     let (mut sender, mut receiver) = conn.split();
//!     while let Ok(Some(frame)) = receiver.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryClient, MemoryConnection};
pub use traits::{Connection, ConnectionId, FrameReceiver, FrameSender, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnection};
