//! Length-prefixed, type-tagged framing.
//!
//! Format (little-endian):
//! - u8  TAG  (message kind)
//! - u32 LEN  (bytes of payload)
//! - [u8; LEN] payload
//!
//! The same layout is used on the reliable stream (frames back to back) and on
//! the unreliable channel (one frame per datagram).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 5;
/// Cap for a single frame; anything larger is treated as corrupt
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("short frame header")]
    ShortHeader,

    #[error("short frame payload: expected {expected} bytes, got {actual}")]
    ShortPayload { expected: usize, actual: usize },

    #[error("frame too large: {0} > {MAX_FRAME_LEN}")]
    TooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

/// Append a framed message to `out`
pub fn write_frame(out: &mut BytesMut, tag: u8, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    out.reserve(HEADER_LEN + payload.len());
    out.put_u8(tag);
    out.put_u32_le(payload.len() as u32);
    out.put_slice(payload);
    Ok(())
}

/// Decode a single frame from the front of `inp`.
/// Returns the frame and the number of bytes consumed.
pub fn read_frame(inp: &[u8]) -> Result<(Frame, usize), FrameError> {
    if inp.len() < HEADER_LEN {
        return Err(FrameError::ShortHeader);
    }
    let mut header = &inp[..HEADER_LEN];
    let tag = header.get_u8();
    let len = header.get_u32_le() as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let available = inp.len() - HEADER_LEN;
    if available < len {
        return Err(FrameError::ShortPayload {
            expected: len,
            actual: available,
        });
    }
    let payload = Bytes::copy_from_slice(&inp[HEADER_LEN..HEADER_LEN + len]);
    Ok((Frame { tag, payload }, HEADER_LEN + len))
}

/// Read one frame from a stream. `Ok(None)` means the stream closed cleanly
/// between frames.
pub async fn read_frame_from<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut cursor = &header[..];
    let tag = cursor.get_u8();
    let len = cursor.get_u32_le() as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        tag,
        payload: Bytes::from(payload),
    }))
}

/// Write pre-framed bytes to a stream
pub async fn write_frame_to<W>(writer: &mut W, framed: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(framed).await?;
    writer.flush().await?;
    Ok(())
}
