//! # courier-protocol
//!
//! Wire protocol definitions for the Courier messaging engine.
//!
//! This crate defines the binary protocol spoken between clients and Courier
//! nodes, and between the nodes of a cluster: frame types, access modes, the
//! length-prefixed MessagePack codec, and versioning.
//!
//! ## Client frames
//!
//! - `Subscribe` / `Leave` - Topic membership
//! - `Publish` - Send messages to topics
//! - `Presence` - Share presence data with co-subscribers
//! - `GetInfo` / `SetInfo` - Topic metadata
//! - `Ack` / `Error` / `Info` - Replies
//! - `Data` / `PresenceEvent` - Broadcasts
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Frame};
//!
//! let frame = Frame::publish(1, "grp1", b"Hello, world!".to_vec());
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: Frame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod access;
pub mod cluster;
pub mod codec;
pub mod frames;
pub mod version;

pub use access::{AccessMode, TopicKind};
pub use cluster::{ClusterAction, ClusterFrame, ClusterFrameKind};
pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType, PresenceAction, SubscriberEntry, TopicDescription};
pub use version::{Version, PROTOCOL_VERSION};
