// Message codec — serialization with size limits to prevent abuse

use super::types::Message;
use anyhow::{bail, Result};

/// Maximum encoded message size: 256 KB
/// This prevents memory exhaustion from malicious oversized messages.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Maximum payload: 64 KB
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Serialize a Message to bytes (bincode)
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    if msg.payload.len() > MAX_PAYLOAD_SIZE {
        bail!(
            "Payload too large: {} bytes (max {})",
            msg.payload.len(),
            MAX_PAYLOAD_SIZE
        );
    }

    let bytes = bincode::serialize(msg)?;

    if bytes.len() > MAX_MESSAGE_SIZE {
        bail!(
            "Encoded message too large: {} bytes (max {})",
            bytes.len(),
            MAX_MESSAGE_SIZE
        );
    }

    Ok(bytes)
}

/// Deserialize bytes to a Message
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        bail!(
            "Message too large: {} bytes (max {})",
            bytes.len(),
            MAX_MESSAGE_SIZE
        );
    }

    let msg: Message = bincode::deserialize(bytes)?;
    Ok(msg)
}

/// Encoded size of a message in bytes, without materializing the encoding.
///
/// Feeds the message buffer's size accounting.
pub fn message_size(msg: &Message) -> Result<u64> {
    Ok(bincode::serialized_size(msg)?)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = Message::request("alice".into(), "bob".into(), b"hello".to_vec());
        let bytes = encode_message(&msg).expect("Failed to encode");
        let decoded = decode_message(&bytes).expect("Failed to decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_payload_too_large() {
        let msg = Message::request("a".into(), "b".into(), vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(encode_message(&msg).is_err());
    }

    #[test]
    fn test_decode_oversized_input_rejected() {
        let bytes = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(decode_message(&bytes).is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = decode_message(&[255, 254, 253]);
        assert!(result.is_err());
    }

    #[test]
    fn test_message_size_matches_encoding() {
        let msg = Message::request("alice".into(), "bob".into(), vec![7; 100]);
        let size = message_size(&msg).expect("Failed to size");
        let bytes = encode_message(&msg).expect("Failed to encode");
        assert_eq!(size, bytes.len() as u64);
    }
}
