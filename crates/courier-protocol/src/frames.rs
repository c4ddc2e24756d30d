//! Frame types for the Courier client protocol.
//!
//! Frames are the unit of communication between clients and a Courier node.
//! Each frame is serialized using MessagePack for efficient binary encoding.

use serde::{Deserialize, Serialize};

use crate::access::{AccessMode, TopicKind};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Subscribe = 0x01,
    Leave = 0x02,
    Publish = 0x03,
    Presence = 0x04,
    GetInfo = 0x05,
    SetInfo = 0x06,
    Ack = 0x10,
    Error = 0x11,
    Data = 0x12,
    PresenceEvent = 0x13,
    Info = 0x14,
    Ping = 0x20,
    Pong = 0x21,
    Connect = 0x22,
    Connected = 0x23,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Subscribe),
            0x02 => Ok(FrameType::Leave),
            0x03 => Ok(FrameType::Publish),
            0x04 => Ok(FrameType::Presence),
            0x05 => Ok(FrameType::GetInfo),
            0x06 => Ok(FrameType::SetInfo),
            0x10 => Ok(FrameType::Ack),
            0x11 => Ok(FrameType::Error),
            0x12 => Ok(FrameType::Data),
            0x13 => Ok(FrameType::PresenceEvent),
            0x14 => Ok(FrameType::Info),
            0x20 => Ok(FrameType::Ping),
            0x21 => Ok(FrameType::Pong),
            0x22 => Ok(FrameType::Connect),
            0x23 => Ok(FrameType::Connected),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Presence event kinds broadcast to topic subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PresenceAction {
    /// A session attached to the topic.
    Join = 0,
    /// A session detached from the topic.
    Leave = 1,
    /// A session changed its presence data.
    Update = 2,
}

impl From<PresenceAction> for u8 {
    fn from(pa: PresenceAction) -> u8 {
        pa as u8
    }
}

impl TryFrom<u8> for PresenceAction {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Join),
            1 => Ok(PresenceAction::Leave),
            2 => Ok(PresenceAction::Update),
            _ => Err("Invalid presence action"),
        }
    }
}

/// One subscriber as seen in a topic description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberEntry {
    /// Session identifier.
    pub session: String,
    /// Authenticated user, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Access mode granted to the session.
    pub mode: AccessMode,
    /// Last sequence id delivered to the session.
    pub last_seen: u64,
    /// Presence data published by the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<serde_json::Value>,
}

/// Snapshot of a topic returned on subscribe and `get_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicDescription {
    /// Topic name.
    pub topic: String,
    /// Topic kind.
    pub kind: TopicKind,
    /// Mode of the requesting session (`None` when not attached).
    pub mode: AccessMode,
    /// Latest assigned sequence id (0 when no message was ever published).
    pub last_seq: u64,
    /// Currently attached subscribers.
    pub subscribers: Vec<SubscriberEntry>,
    /// Public topic metadata set through `set_info`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<serde_json::Value>,
}

fn default_mode() -> AccessMode {
    AccessMode::Write
}

/// A protocol frame.
///
/// Client requests carry an `id` chosen by the client; every reply (`ack`,
/// `info`, `error`) echoes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Join a topic.
    #[serde(rename = "subscribe")]
    Subscribe {
        /// Request ID.
        id: u64,
        /// Topic name.
        topic: String,
        /// Requested access mode.
        #[serde(default = "default_mode")]
        mode: AccessMode,
    },

    /// Leave a topic.
    #[serde(rename = "leave")]
    Leave {
        /// Request ID.
        id: u64,
        /// Topic name.
        topic: String,
        /// Also drop the persisted membership.
        #[serde(default)]
        unsubscribe: bool,
    },

    /// Publish a message to a topic.
    #[serde(rename = "publish")]
    Publish {
        /// Request ID.
        id: u64,
        /// Target topic.
        topic: String,
        /// Message payload.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Change own presence data on a topic.
    #[serde(rename = "presence")]
    Presence {
        /// Request ID.
        id: u64,
        /// Topic name.
        topic: String,
        /// Presence metadata.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },

    /// Request a topic description.
    #[serde(rename = "get_info")]
    GetInfo {
        /// Request ID.
        id: u64,
        /// Topic name.
        topic: String,
    },

    /// Replace the public topic metadata.
    #[serde(rename = "set_info")]
    SetInfo {
        /// Request ID.
        id: u64,
        /// Topic name.
        topic: String,
        /// New metadata.
        info: serde_json::Value,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
        /// Topic the request addressed.
        topic: String,
        /// Sequence id assigned to a published message.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        /// Server timestamp (ms since epoch).
        timestamp: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// A message delivered to topic subscribers.
    #[serde(rename = "data")]
    Data {
        /// Topic the message was published to.
        topic: String,
        /// Publishing session.
        from: String,
        /// Publishing user, if authenticated.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        /// Topic sequence id.
        seq: u64,
        /// Server timestamp (ms since epoch).
        timestamp: u64,
        /// Message payload.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Presence change broadcast to topic subscribers.
    #[serde(rename = "presence_event")]
    PresenceEvent {
        /// Topic name.
        topic: String,
        /// What happened.
        action: PresenceAction,
        /// Session concerned.
        session: String,
        /// User concerned, if authenticated.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        /// Presence metadata.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },

    /// Topic description, in reply to subscribe or `get_info`, or broadcast
    /// after `set_info` (with `id` 0).
    #[serde(rename = "info")]
    Info {
        /// ID of the request (0 for broadcasts).
        id: u64,
        /// The description.
        description: TopicDescription,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Initial connection handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol major version.
        version: u8,
        /// Optional authentication token.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Session established response.
    #[serde(rename = "connected")]
    Connected {
        /// Session identifier assigned by the node.
        session_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::Publish { .. } => FrameType::Publish,
            Frame::Presence { .. } => FrameType::Presence,
            Frame::GetInfo { .. } => FrameType::GetInfo,
            Frame::SetInfo { .. } => FrameType::SetInfo,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Data { .. } => FrameType::Data,
            Frame::PresenceEvent { .. } => FrameType::PresenceEvent,
            Frame::Info { .. } => FrameType::Info,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
        }
    }

    /// The topic a frame addresses, if any.
    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        match self {
            Frame::Subscribe { topic, .. }
            | Frame::Leave { topic, .. }
            | Frame::Publish { topic, .. }
            | Frame::Presence { topic, .. }
            | Frame::GetInfo { topic, .. }
            | Frame::SetInfo { topic, .. }
            | Frame::Ack { topic, .. }
            | Frame::Data { topic, .. }
            | Frame::PresenceEvent { topic, .. } => Some(topic),
            Frame::Info { description, .. } => Some(&description.topic),
            _ => None,
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u64, topic: impl Into<String>, mode: AccessMode) -> Self {
        Frame::Subscribe {
            id,
            topic: topic.into(),
            mode,
        }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(id: u64, topic: impl Into<String>) -> Self {
        Frame::Leave {
            id,
            topic: topic.into(),
            unsubscribe: false,
        }
    }

    /// Create a new Publish frame.
    #[must_use]
    pub fn publish(id: u64, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Publish {
            id,
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64, topic: impl Into<String>, seq: Option<u64>, timestamp: u64) -> Self {
        Frame::Ack {
            id,
            topic: topic.into(),
            seq,
            timestamp,
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(session_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            session_id: session_id.into(),
            version,
            heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let subscribe = Frame::subscribe(1, "grp1", AccessMode::Write);
        assert_eq!(subscribe.frame_type(), FrameType::Subscribe);
        assert_eq!(subscribe.topic(), Some("grp1"));

        let publish = Frame::publish(2, "grp1", b"hello".to_vec());
        assert_eq!(publish.frame_type(), FrameType::Publish);

        assert_eq!(Frame::ping().topic(), None);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x12), Ok(FrameType::Data));
        assert_eq!(u8::from(FrameType::Connected), 0x23);
        assert!(FrameType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_presence_action_conversion() {
        assert_eq!(PresenceAction::try_from(0), Ok(PresenceAction::Join));
        assert_eq!(PresenceAction::try_from(1), Ok(PresenceAction::Leave));
        assert_eq!(PresenceAction::try_from(2), Ok(PresenceAction::Update));
        assert!(PresenceAction::try_from(3).is_err());
    }

    #[test]
    fn test_subscribe_mode_defaults_to_write() {
        let json = r#"{"type":"subscribe","id":7,"topic":"grp1"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame, Frame::subscribe(7, "grp1", AccessMode::Write));
    }
}
