//! Frame extraction and single-frame stream helpers.
//!
//! Frames use the layout described in [`crate::packet`]: a 2-byte size that
//! counts the whole frame, a 2-byte protocol id, then the payload.
//!
//! [`extract_frames`] is the receive-side loop: it walks an unread byte
//! window, hands every complete frame to a callback and reports how many
//! bytes it consumed. A trailing partial frame is left for the next read.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::packet::{HEADER_SIZE, MAX_FRAME_SIZE, PacketHeader};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest frame accepted, header included. Default: 65535.
    pub max_frame_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A header declared fewer bytes than the header itself.
    #[error("declared frame size {size} is smaller than the {HEADER_SIZE}-byte header")]
    Undersized {
        /// The declared size.
        size: usize,
    },

    /// A header declared more bytes than can ever be buffered.
    #[error("declared frame size {size} exceeds maximum {max}")]
    Oversized {
        /// The declared size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate a declared frame size against the header length and `config`.
fn check_size(size: usize, config: &FrameConfig) -> Result<(), FrameError> {
    if size < HEADER_SIZE {
        return Err(FrameError::Undersized { size });
    }
    if size > config.max_frame_size {
        return Err(FrameError::Oversized {
            size,
            max: config.max_frame_size,
        });
    }
    Ok(())
}

/// Split every complete frame out of `window`.
///
/// Calls `on_frame` once per frame, in stream order, with exactly the frame's
/// bytes (header included). Returns the number of bytes consumed, which is
/// always the end of the last complete frame. Fewer than four bytes, or a
/// frame whose declared size exceeds what is available, stops the loop
/// without error: the caller keeps those bytes for the next read.
///
/// An implausible declared size ([`FrameError::Undersized`] or
/// [`FrameError::Oversized`]) can never be parsed and is returned as an
/// error; frames before it have already been delivered.
pub fn extract_frames<F>(
    window: &[u8],
    config: &FrameConfig,
    mut on_frame: F,
) -> Result<usize, FrameError>
where
    F: FnMut(&[u8]),
{
    let mut consumed = 0;
    loop {
        let rest = &window[consumed..];
        let Some(header) = PacketHeader::parse(rest) else {
            break;
        };
        let size = usize::from(header.size);
        check_size(size, config)?;
        if size > rest.len() {
            break;
        }
        on_frame(&rest[..size]);
        consumed += size;
    }
    Ok(consumed)
}

/// Read a single frame from the stream.
///
/// Returns the header and the payload bytes. Returns
/// [`FrameError::ConnectionClosed`] if the peer closes the connection before
/// the frame is complete.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<(PacketHeader, Vec<u8>), FrameError> {
    let mut head = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let header = PacketHeader {
        size: u16::from_le_bytes([head[0], head[1]]),
        protocol: u16::from_le_bytes([head[2], head[3]]),
    };
    let size = usize::from(header.size);
    check_size(size, config)?;

    let mut payload = vec![0u8; size - HEADER_SIZE];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::ConnectionClosed
            } else {
                FrameError::Io(e)
            }
        })?;
    }

    Ok((header, payload))
}

/// Write a single frame carrying `payload` under `protocol`.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    protocol: u16,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let size = HEADER_SIZE + payload.len();
    let max = config.max_frame_size.min(MAX_FRAME_SIZE);
    if size > max {
        return Err(FrameError::Oversized { size, max });
    }

    let header = PacketHeader {
        size: size as u16,
        protocol,
    };
    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}
