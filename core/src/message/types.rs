// Message types — what the relay core carries on behalf of peers

use serde::{Deserialize, Serialize};

/// What kind of traffic this message carries.
///
/// The relay does not interpret payloads; the kind only exists so a
/// dispatcher can route requests and so map updates are recognizable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Application request expecting a response
    Request,
    /// Response to an earlier request
    Response,
    /// Periodic routing-table refresh from an unreachable peer
    MapUpdate,
}

/// A protocol message as seen by the relay core.
///
/// The payload is opaque: encryption and signatures happen in layers this
/// crate does not own. Sender and recipient are opaque peer id strings
/// (hash of a public key, rendered as hex by convention).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID (UUID v4)
    pub id: String,
    /// Sender's peer ID
    pub sender_id: String,
    /// Recipient's peer ID
    pub recipient_id: String,
    /// Message kind
    pub kind: MessageKind,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
}

impl Message {
    /// Create a new request message
    pub fn request(sender_id: String, recipient_id: String, payload: Vec<u8>) -> Self {
        Self::new(sender_id, recipient_id, MessageKind::Request, payload)
    }

    /// Create a response to an existing request, inheriting its message id
    pub fn response_to(request: &Message, payload: Vec<u8>) -> Self {
        Self {
            id: request.id.clone(),
            sender_id: request.recipient_id.clone(),
            recipient_id: request.sender_id.clone(),
            kind: MessageKind::Response,
            payload,
            timestamp: now_secs(),
        }
    }

    /// Create a map-update message (liveness refresh)
    pub fn map_update(sender_id: String, recipient_id: String) -> Self {
        Self::new(sender_id, recipient_id, MessageKind::MapUpdate, Vec::new())
    }

    fn new(sender_id: String, recipient_id: String, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id,
            recipient_id,
            kind,
            payload,
            timestamp: now_secs(),
        }
    }

    /// Re-address this message to a new recipient, keeping everything else
    pub fn readdressed_to(mut self, recipient_id: String) -> Self {
        self.recipient_id = recipient_id;
        self
    }
}

/// Current unix timestamp in seconds
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// TESTS
// ============================================================================
