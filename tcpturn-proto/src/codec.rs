//! Serialization and framing for the `tcpturn` control channel.
//!
//! Provides encode/decode functions using postcard, length-prefix framing
//! for buffered input, and async helpers that read and write frames directly
//! on a tokio stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{MAX_MESSAGE_SIZE, TurnMessage};

/// Size of the little-endian length prefix in front of every frame.
pub const LENGTH_PREFIX: usize = 4;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame is incomplete or has an invalid length prefix.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// Frame length exceeds [`MAX_MESSAGE_SIZE`].
    #[error("frame of {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    FrameTooLarge(usize),
    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes a [`TurnMessage`] into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the message cannot be serialized.
pub fn encode(msg: &TurnMessage) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(msg).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`TurnMessage`] from a byte slice using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode(bytes: &[u8]) -> Result<TurnMessage, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a [`TurnMessage`] with a 4-byte little-endian length prefix.
///
/// Wire format: `[u32 length (LE)][payload bytes]`
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the message cannot be serialized,
/// or `CodecError::FrameTooLarge` if the encoding exceeds
/// [`MAX_MESSAGE_SIZE`].
pub fn encode_framed(msg: &TurnMessage) -> Result<Vec<u8>, CodecError> {
    let payload = encode(msg)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }
    // Bounded by MAX_MESSAGE_SIZE above.
    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes a length-prefixed frame back into a [`TurnMessage`].
///
/// Returns the decoded message and the total number of bytes consumed
/// from the input (including the 4-byte length prefix).
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the input is too short or the
/// length prefix indicates more data than available,
/// `CodecError::FrameTooLarge` if the prefix exceeds [`MAX_MESSAGE_SIZE`],
/// or `CodecError::Serialization` if the payload cannot be deserialized.
pub fn decode_framed(bytes: &[u8]) -> Result<(TurnMessage, usize), CodecError> {
    if bytes.len() < LENGTH_PREFIX {
        return Err(CodecError::InvalidFrame(format!(
            "need at least {LENGTH_PREFIX} bytes for length prefix, got {}",
            bytes.len()
        )));
    }
    let len_bytes: [u8; LENGTH_PREFIX] = bytes[..LENGTH_PREFIX]
        .try_into()
        .map_err(|_| CodecError::InvalidFrame("failed to read length prefix".into()))?;
    let payload_len = u32::from_le_bytes(len_bytes) as usize;
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(CodecError::FrameTooLarge(payload_len));
    }

    let total_len = LENGTH_PREFIX + payload_len;
    if bytes.len() < total_len {
        return Err(CodecError::InvalidFrame(format!(
            "frame indicates {} bytes but only {} available",
            payload_len,
            bytes.len() - LENGTH_PREFIX
        )));
    }

    let msg = decode(&bytes[LENGTH_PREFIX..total_len])?;
    Ok((msg, total_len))
}

/// Reads one frame body from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
/// The body is returned undecoded so a caller can skip a malformed message
/// without giving up on the stream.
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` for an oversized length prefix and
/// `CodecError::Io` if the stream fails or ends mid-frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Encodes `msg` and writes it to `writer` as one frame.
///
/// # Errors
///
/// Returns any encoding error from [`encode_framed`] or `CodecError::Io`
/// if the write fails.
pub async fn write_frame<W>(writer: &mut W, msg: &TurnMessage) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_framed(msg)?;
    writer.write_all(&frame).await?;
    Ok(())
}
