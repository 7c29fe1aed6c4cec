//! Framing: type code (4 bytes BE) + bincode payload.
//!
//! Decoding is total: anything that is not a well-formed known frame comes
//! back as [`WireMessage::Unrecognized`] carrying the full input.

use crate::identity::PeerId;
use crate::protocol::{
    AnnouncePayload, ChatPayload, WireMessage, TYPE_ANNOUNCE, TYPE_CHAT,
};

const CODE_SIZE: usize = 4;

/// Encode a message into a single frame.
pub fn encode(msg: &WireMessage) -> Result<Vec<u8>, EncodeError> {
    let payload = match msg {
        WireMessage::Announce {
            origin_peer_id,
            display_name,
        } => bincode::serialize(&AnnouncePayload {
            origin_peer_id: origin_peer_id.as_str().to_owned(),
            display_name: display_name.clone(),
        })?,
        WireMessage::Chat {
            message_id,
            origin_peer_id,
            body,
            sent_at,
            received_at,
        } => bincode::serialize(&ChatPayload {
            message_id: message_id.to_string(),
            origin_peer_id: origin_peer_id.as_str().to_owned(),
            body: body.clone(),
            sent_at: *sent_at,
            received_at: *received_at,
        })?,
        // Only a decode outcome; written as a bare code.
        WireMessage::Unrecognized { .. } => Vec::new(),
    };
    let mut out = Vec::with_capacity(CODE_SIZE + payload.len());
    out.extend_from_slice(&msg.type_code().to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message (bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Decode one frame. Never fails.
pub fn decode(bytes: &[u8]) -> WireMessage {
    let unrecognized = || WireMessage::Unrecognized {
        raw_bytes: bytes.to_vec(),
    };
    if bytes.len() < CODE_SIZE {
        return unrecognized();
    }
    let code = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let body = &bytes[CODE_SIZE..];
    match code {
        TYPE_ANNOUNCE => match bincode::deserialize::<AnnouncePayload>(body) {
            Ok(p) => WireMessage::Announce {
                origin_peer_id: PeerId::new(p.origin_peer_id),
                display_name: p.display_name,
            },
            Err(_) => unrecognized(),
        },
        TYPE_CHAT => {
            let Ok(p) = bincode::deserialize::<ChatPayload>(body) else {
                return unrecognized();
            };
            let Ok(message_id) = uuid::Uuid::parse_str(&p.message_id) else {
                return unrecognized();
            };
            WireMessage::Chat {
                message_id,
                origin_peer_id: PeerId::new(p.origin_peer_id),
                body: p.body,
                sent_at: p.sent_at,
                received_at: p.received_at,
            }
        }
        _ => unrecognized(),
    }
}
