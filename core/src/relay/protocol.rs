//! Relay protocol — messages and serialization
//!
//! One framed request/response pair per exchange: relay setup, forwarded
//! envelopes (persistent variant), map updates and buffer retrieval (push
//! variant), and the delegate wake-up RPC.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relay strategy for a session. Immutable once the session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayType {
    /// One open bidirectional channel is reused for every message
    PersistentConnection,
    /// No open channel; the device is woken through a push gateway and
    /// then polls the relay for buffered traffic
    PushNotification,
}

/// Push-variant session parameters supplied by the unreachable peer at
/// setup time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushSetup {
    /// Opaque device registration id assigned by the push gateway
    pub registration_id: String,
    /// How often the device promises to send map updates, in seconds
    pub map_update_interval_secs: u64,
    /// Addresses of peers known to hold gateway credentials, tried in
    /// order when this relay holds none itself
    pub delegates: Vec<String>,
}

/// Relay setup outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SetupDecision {
    /// Relay accepted the session
    Ok,
    /// Relay refused the requested role
    Denied { reason: String },
}

/// Protocol command codes, used as dispatcher keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayCommand {
    Setup,
    Forward,
    MapUpdate,
    BufferRetrieval,
    Wakeup,
}

/// A relay protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Unreachable peer asks a reachable peer to relay for it
    SetupRequest {
        /// Speaker's protocol version; mismatches are denied at setup
        version: u32,
        /// Requesting peer's ID
        peer_id: String,
        /// Which relay strategy to use
        relay_type: RelayType,
        /// Push parameters; required for `PushNotification`
        push: Option<PushSetup>,
    },
    /// Relay's answer to a setup request
    SetupResponse {
        /// OK or DENIED with a reason
        decision: SetupDecision,
    },
    /// An intercepted message re-wrapped for the unreachable peer
    /// (persistent variant)
    ForwardEnvelope {
        /// Original sender's peer ID
        sender_id: String,
        /// Unreachable recipient's peer ID
        recipient_id: String,
        /// Encoded inner message
        payload: Vec<u8>,
    },
    /// The unreachable peer's answer to a forwarded envelope
    ForwardResponse {
        /// Encoded inner response
        payload: Vec<u8>,
    },
    /// Periodic liveness refresh from the unreachable peer (push variant)
    MapUpdate {
        /// Refreshing peer's ID
        peer_id: String,
    },
    /// Map-update reply; carries any buffered batch ready for pickup
    MapUpdateAck {
        /// Encoded messages buffered since the last pickup
        buffered: Vec<Vec<u8>>,
    },
    /// Poll for buffered traffic, sent after the device was woken
    BufferRetrieval {
        /// Polling peer's ID
        peer_id: String,
    },
    /// Buffered traffic for the polling peer
    BufferResponse {
        /// Encoded messages, oldest first
        envelopes: Vec<Vec<u8>>,
    },
    /// Delegate RPC: ask a credential-holding peer to wake a device
    Wakeup {
        /// Device registration id to wake
        registration_id: String,
        /// Coalescing key so the gateway collapses repeated wake-ups
        collapse_key: String,
        /// Peer the wake-up is on behalf of
        recipient_id: String,
    },
    /// Wake-up delivered; carries the gateway's message id
    WakeupAck {
        /// Gateway-assigned message id
        message_id: String,
    },
    /// Request could not be served
    Denied {
        /// Human-readable reason
        reason: String,
    },
}

/// Protocol version carried in every setup request
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size accepted off the wire: 16 MB
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Relay message serialization errors
#[derive(Debug, Error)]
pub enum RelayProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(usize),
}

impl RelayMessage {
    /// Serialize a relay message to bytes using bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayProtocolError> {
        bincode::serialize(self).map_err(|e| RelayProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize a relay message from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayProtocolError> {
        bincode::deserialize(bytes)
            .map_err(|e| RelayProtocolError::DeserializationError(e.to_string()))
    }

    /// The command code this message belongs to, for dispatcher routing
    pub fn command(&self) -> RelayCommand {
        match self {
            RelayMessage::SetupRequest { .. } | RelayMessage::SetupResponse { .. } => {
                RelayCommand::Setup
            }
            RelayMessage::ForwardEnvelope { .. } | RelayMessage::ForwardResponse { .. } => {
                RelayCommand::Forward
            }
            RelayMessage::MapUpdate { .. } | RelayMessage::MapUpdateAck { .. } => {
                RelayCommand::MapUpdate
            }
            RelayMessage::BufferRetrieval { .. } | RelayMessage::BufferResponse { .. } => {
                RelayCommand::BufferRetrieval
            }
            RelayMessage::Wakeup { .. } | RelayMessage::WakeupAck { .. } => RelayCommand::Wakeup,
            // A denial answers whatever was asked; route with setup
            RelayMessage::Denied { .. } => RelayCommand::Setup,
        }
    }

    /// Human-readable message type, for logs
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayMessage::SetupRequest { .. } => "SetupRequest",
            RelayMessage::SetupResponse { .. } => "SetupResponse",
            RelayMessage::ForwardEnvelope { .. } => "ForwardEnvelope",
            RelayMessage::ForwardResponse { .. } => "ForwardResponse",
            RelayMessage::MapUpdate { .. } => "MapUpdate",
            RelayMessage::MapUpdateAck { .. } => "MapUpdateAck",
            RelayMessage::BufferRetrieval { .. } => "BufferRetrieval",
            RelayMessage::BufferResponse { .. } => "BufferResponse",
            RelayMessage::Wakeup { .. } => "Wakeup",
            RelayMessage::WakeupAck { .. } => "WakeupAck",
            RelayMessage::Denied { .. } => "Denied",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
