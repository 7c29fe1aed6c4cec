//! Mesh wire protocol: message kinds, type codes, and delivery states.

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Type code of an identity announcement frame.
pub const TYPE_ANNOUNCE: i32 = 1;
/// Type code of a chat frame.
pub const TYPE_CHAT: i32 = 2;
/// Type code written for `Unrecognized`. Never produced by a real peer.
pub const TYPE_UNKNOWN: i32 = -1;

/// `received_at` value meaning "not yet received".
pub const NO_RECEIVED_TIME: i64 = -1;

/// All wire message kinds. Framing is a big-endian type code followed by a
/// bincode payload (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Sent by each side once a connection is established.
    Announce {
        origin_peer_id: PeerId,
        display_name: String,
    },
    /// A user-visible message.
    Chat {
        message_id: uuid::Uuid,
        origin_peer_id: PeerId,
        body: String,
        sent_at: i64,
        received_at: i64,
    },
    /// Any frame we could not make sense of. Kept whole for logging.
    Unrecognized { raw_bytes: Vec<u8> },
}

impl WireMessage {
    pub fn type_code(&self) -> i32 {
        match self {
            WireMessage::Announce { .. } => TYPE_ANNOUNCE,
            WireMessage::Chat { .. } => TYPE_CHAT,
            WireMessage::Unrecognized { .. } => TYPE_UNKNOWN,
        }
    }
}

/// Serialized body of an `Announce` frame.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AnnouncePayload {
    pub origin_peer_id: String,
    pub display_name: String,
}

/// Serialized body of a `Chat` frame. The id travels as its string form.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ChatPayload {
    pub message_id: String,
    pub origin_peer_id: String,
    pub body: String,
    pub sent_at: i64,
    pub received_at: i64,
}

/// Lifecycle status of a stored message.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Received from a peer; nothing to deliver.
    None,
    Error,
    NoEndpoint,
    Sending,
    Success,
}

impl DeliveryState {
    /// Stable numeric code used by persistent stores.
    pub fn code(self) -> i32 {
        match self {
            DeliveryState::None => -1,
            DeliveryState::Error => 0,
            DeliveryState::NoEndpoint => 1,
            DeliveryState::Sending => 2,
            DeliveryState::Success => 3,
        }
    }

    /// Inverse of [`code`](Self::code). Unknown codes map to `None`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => DeliveryState::Error,
            1 => DeliveryState::NoEndpoint,
            2 => DeliveryState::Sending,
            3 => DeliveryState::Success,
            _ => DeliveryState::None,
        }
    }
}
