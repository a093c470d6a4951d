//! Encoding and framing.
//!
//! Messages are JSON documents. On stream transports each one travels as a
//! frame: a 4-byte big-endian length prefix followed by the UTF-8 payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use super::message::Message;
use super::types::CallId;
use crate::config::ProtocolConfig;
use crate::error::{Result, RpcError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Serialize a message to its payload bytes.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| RpcError::Serialization {
        message: format!("failed to encode {} message: {}", message.kind_name(), e),
        source: Some(e),
    })
}

/// Deserialize payload bytes into a message.
pub fn decode(payload: &[u8]) -> Result<Message> {
    serde_json::from_slice(payload).map_err(|e| RpcError::Serialization {
        message: format!("failed to decode message: {}", e),
        source: Some(e),
    })
}

/// Best-effort extraction of the `id` field from a payload that failed to decode.
pub fn peek_id(payload: &[u8]) -> Option<CallId> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value.get("id")?.as_u64()
}

/// Encode a message that is about to be sent.
///
/// A payload over the frame limit fails with [`RpcError::Serialization`]
/// before anything is written, so only the call that produced it fails.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let payload = encode(message)?;
    if payload.len() > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(RpcError::serialization(format!(
            "{} message of {} bytes exceeds the {} byte frame limit",
            message.kind_name(),
            payload.len(),
            ProtocolConfig::MAX_FRAME_SIZE
        )));
    }
    Ok(payload)
}

pub(crate) fn check_frame_size(len: usize) -> Result<()> {
    if len > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge {
            size: len,
            max: ProtocolConfig::MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin + ?Sized>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    check_frame_size(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin + ?Sized>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    check_frame_size(payload.len())?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
