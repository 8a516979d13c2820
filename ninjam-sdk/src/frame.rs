//! Frame reader: pulls one header and its declared payload off a stream.
//!
//! Any failure here is fatal to the session. A stream that ends between
//! or inside frames, that announces a payload larger than
//! [`MAX_PAYLOAD_LEN`], or that stops delivering a payload half way,
//! leaves us unable to find the next frame boundary.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::{FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the connection before a complete frame arrived.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("declared payload of {0} bytes exceeds the 16 MiB frame limit")]
    PayloadTooLarge(u32),

    #[error("payload of {length} bytes not complete after {limit:?}")]
    Stalled { length: u32, limit: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<FrameHeader, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(eof_as_closed)?;
    let header = FrameHeader::decode(&header);

    if header.length > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(header.length));
    }
    Ok(header)
}

async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, header: FrameHeader) -> Result<Vec<u8>, FrameError> {
    let mut payload = vec![0u8; header.length as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await.map_err(eof_as_closed)?;
    }
    Ok(payload)
}

/// Read a single frame. Blocks until the whole payload is available.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(FrameHeader, Vec<u8>), FrameError> {
    let header = read_header(reader).await?;
    let payload = read_payload(reader, header).await?;
    Ok((header, payload))
}

/// Like [`read_frame`], but once a header has arrived its payload must
/// follow within `limit`. Waiting for the next header is unbounded.
pub async fn read_frame_within<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: Duration,
) -> Result<(FrameHeader, Vec<u8>), FrameError> {
    let header = read_header(reader).await?;
    let payload = tokio::time::timeout(limit, read_payload(reader, header))
        .await
        .map_err(|_| FrameError::Stalled {
            length: header.length,
            limit,
        })??;
    Ok((header, payload))
}
