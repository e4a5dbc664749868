//! Messages and their codec
//!
//! The relay core treats messages as mostly-opaque: it needs sender and
//! recipient ids for routing, the kind for dispatch, and the encoded size
//! for buffer accounting. Everything else passes through untouched.

pub mod codec;
pub mod types;

pub use codec::{decode_message, encode_message, message_size, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE};
pub use types::{now_secs, Message, MessageKind};
