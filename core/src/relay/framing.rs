//! Length-prefixed framing for relay exchanges
//!
//! Every relay message travels as a u32 big-endian length followed by the
//! bincode body. Frames above `MAX_FRAME_SIZE` are rejected before any
//! allocation happens.

use super::protocol::{RelayMessage, RelayProtocolError, MAX_FRAME_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] RelayProtocolError),
}

/// Write one framed relay message
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &RelayMessage,
) -> Result<(), FramingError> {
    let payload = message.to_bytes()?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed relay message
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RelayMessage, FramingError> {
    let len = reader.read_u32().await? as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(RelayProtocolError::InvalidFrameLength(len).into());
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(RelayMessage::from_bytes(&buf)?)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let msg = RelayMessage::MapUpdate {
            peer_id: "peer1".to_string(),
        };

        let mut wire = Vec::new();
        write_frame(&mut wire, &msg).await.expect("write failed");

        let mut cursor = std::io::Cursor::new(wire);
        let restored = read_frame(&mut cursor).await.expect("read failed");
        assert_eq!(msg, restored);
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let wire = 0u32.to_be_bytes().to_vec();
        let mut cursor = std::io::Cursor::new(wire);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let wire = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        let mut cursor = std::io::Cursor::new(wire);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame_fails() {
        let msg = RelayMessage::MapUpdate {
            peer_id: "peer1".to_string(),
        };
        let mut wire = Vec::new();
        write_frame(&mut wire, &msg).await.expect("write failed");
        wire.truncate(wire.len() - 2);

        let mut cursor = std::io::Cursor::new(wire);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
