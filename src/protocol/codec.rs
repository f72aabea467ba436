//! Frame reading/writing over an ordered byte stream.

use crate::error::{Error, Result};
use crate::protocol::frame::{Frame, FrameKind};
use crate::protocol::MAX_FRAME_SIZE;
use bytes::Bytes;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read a single frame from the stream.
///
/// Returns `Ok(None)` when the stream ends exactly on a frame boundary. An end
/// of stream anywhere inside a frame is a `MalformedFrame`.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    let n = r.read(&mut len_buf[..1]).await?;
    if n == 0 {
        return Ok(None);
    }
    read_exact_in_frame(r, &mut len_buf[1..], "frame length").await?;
    let len = u32::from_be_bytes(len_buf);

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(Error::MalformedFrame(format!(
            "frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut kind_buf = [0u8; 1];
    read_exact_in_frame(r, &mut kind_buf, "frame kind").await?;
    let kind = FrameKind::from_u8(kind_buf[0])
        .ok_or_else(|| Error::MalformedFrame(format!("unknown frame kind {}", kind_buf[0])))?;

    let mut payload = vec![0u8; len as usize];
    read_exact_in_frame(r, &mut payload, "frame payload").await?;

    Frame::decode(kind, Bytes::from(payload)).map(Some)
}

async fn read_exact_in_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    match r.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::MalformedFrame(format!(
            "stream ended inside {}",
            what
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Encode and write one frame, then flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<()> {
    let encoded = frame.encode()?;
    w.write_all(&encoded).await?;
    w.flush().await?;
    Ok(())
}
