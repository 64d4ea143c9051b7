//! Framed packets backed by pooled buffers.
//!
//! Every packet on the wire is one frame:
//!
//! ```text
//! +------------------+------------------+---------------------------+
//! | size (2 bytes)   | protocol (2)     |  payload                  |
//! | u16 little-end.  | u16 little-end.  |  (size - 4 bytes)         |
//! +------------------+------------------+---------------------------+
//! ```
//!
//! `size` counts the whole frame, header included. Outbound packets are
//! written in two passes: the protocol id when the packet is opened, the size
//! when it is [finalized](Packet::finalize).

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::buffer::BufferError;
use crate::pool::{BufferPool, PooledBuffer};

/// Bytes taken by the `size` + `protocol` header.
pub const HEADER_SIZE: usize = 4;

/// Largest frame the 16-bit size field can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The fixed 4-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total frame length, header included.
    pub size: u16,
    /// Protocol id used to pick a handler.
    pub protocol: u16,
}

impl PacketHeader {
    /// Parse the header from the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// Returns `None` when fewer than four bytes are available.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            size: u16::from_le_bytes([bytes[0], bytes[1]]),
            protocol: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }

    /// Encode the header in wire order.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let size = self.size.to_le_bytes();
        let protocol = self.protocol.to_le_bytes();
        [size[0], size[1], protocol[0], protocol[1]]
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while building, parsing or decoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The backing buffer had no room for the operation.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// The packet was already finalized and can no longer be modified.
    #[error("packet already finalized")]
    AlreadyFinalized,

    /// The packet was handed to the send path before being finalized.
    #[error("packet not finalized")]
    NotFinalized,

    /// The frame would not fit in the 16-bit size field.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Frame size the caller asked for.
        size: usize,
        /// Largest representable frame.
        max: usize,
    },

    /// Raw bytes did not form exactly one frame.
    #[error("malformed frame: header declares {declared} bytes, got {actual}")]
    Malformed {
        /// Size announced by the header (0 if the header itself was cut).
        declared: usize,
        /// Bytes actually supplied.
        actual: usize,
    },

    /// The message serializer wrote a different length than it announced.
    #[error("message announced {announced} bytes but wrote {written}")]
    LengthMismatch {
        /// Value of [`OutboundMessage::serialized_len`].
        announced: usize,
        /// Bytes reported by [`OutboundMessage::serialize_into`].
        written: usize,
    },

    /// Postcard encoding or decoding failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Outbound message contract
// ---------------------------------------------------------------------------

/// A payload that can be serialized straight into a packet buffer.
pub trait OutboundMessage {
    /// Exact number of bytes [`serialize_into`](Self::serialize_into) writes.
    fn serialized_len(&self) -> usize;

    /// Serialize into `buf`, which is exactly `serialized_len()` bytes long.
    /// Returns the number of bytes written.
    fn serialize_into(&self, buf: &mut [u8]) -> Result<usize, PacketError>;
}

impl OutboundMessage for [u8] {
    fn serialized_len(&self) -> usize {
        self.len()
    }

    fn serialize_into(&self, buf: &mut [u8]) -> Result<usize, PacketError> {
        buf[..self.len()].copy_from_slice(self);
        Ok(self.len())
    }
}

impl<const N: usize> OutboundMessage for [u8; N] {
    fn serialized_len(&self) -> usize {
        N
    }

    fn serialize_into(&self, buf: &mut [u8]) -> Result<usize, PacketError> {
        self.as_slice().serialize_into(buf)
    }
}

impl OutboundMessage for Vec<u8> {
    fn serialized_len(&self) -> usize {
        self.len()
    }

    fn serialize_into(&self, buf: &mut [u8]) -> Result<usize, PacketError> {
        self.as_slice().serialize_into(buf)
    }
}

impl<T: OutboundMessage + ?Sized> OutboundMessage for &T {
    fn serialized_len(&self) -> usize {
        (**self).serialized_len()
    }

    fn serialize_into(&self, buf: &mut [u8]) -> Result<usize, PacketError> {
        (**self).serialize_into(buf)
    }
}

/// A `serde` value pre-encoded with [`postcard`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Postcard {
    bytes: Vec<u8>,
}

impl Postcard {
    /// Encode `value`.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, PacketError> {
        Ok(Self {
            bytes: postcard::to_allocvec(value)?,
        })
    }

    /// The encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl OutboundMessage for Postcard {
    fn serialized_len(&self) -> usize {
        self.bytes.len()
    }

    fn serialize_into(&self, buf: &mut [u8]) -> Result<usize, PacketError> {
        self.bytes.serialize_into(buf)
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One frame held in a pooled buffer.
///
/// The buffer goes back to its pool when the packet drops.
pub struct Packet {
    buffer: PooledBuffer,
    finalized: bool,
}

impl Packet {
    /// Start an outbound packet: acquire a buffer and reserve the header.
    pub fn open_for_write(pool: &Arc<BufferPool>) -> Result<Self, PacketError> {
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(&[0u8; HEADER_SIZE])?;
        Ok(Self {
            buffer,
            finalized: false,
        })
    }

    /// Build a finalized packet carrying `message` under `protocol`.
    pub fn build<M: OutboundMessage + ?Sized>(
        pool: &Arc<BufferPool>,
        protocol: u16,
        message: &M,
    ) -> Result<Self, PacketError> {
        let mut packet = Self::open_for_write(pool)?;
        packet.set_protocol(protocol)?;
        packet.append_payload(message)?;
        packet.finalize()?;
        Ok(packet)
    }

    /// Copy one complete received frame into a pooled buffer.
    ///
    /// `bytes` must hold exactly the frame its header declares.
    pub fn from_bytes(pool: &Arc<BufferPool>, bytes: &[u8]) -> Result<Self, PacketError> {
        let header = PacketHeader::parse(bytes).ok_or(PacketError::Malformed {
            declared: 0,
            actual: bytes.len(),
        })?;
        let declared = usize::from(header.size);
        if declared != bytes.len() || declared < HEADER_SIZE {
            return Err(PacketError::Malformed {
                declared,
                actual: bytes.len(),
            });
        }

        let mut buffer = pool.acquire();
        buffer.extend_from_slice(bytes)?;
        Ok(Self {
            buffer,
            finalized: true,
        })
    }

    /// Write `id` into the protocol field.
    pub fn set_protocol(&mut self, id: u16) -> Result<(), PacketError> {
        self.ensure_open()?;
        self.buffer.head_mut(HEADER_SIZE)[2..4].copy_from_slice(&id.to_le_bytes());
        Ok(())
    }

    /// Serialize `message` at the tail of the packet.
    pub fn append_payload<M: OutboundMessage + ?Sized>(
        &mut self,
        message: &M,
    ) -> Result<(), PacketError> {
        self.ensure_open()?;

        let len = message.serialized_len();
        let frame_size = self.buffer.write_pos() + len;
        if frame_size > MAX_FRAME_SIZE {
            return Err(PacketError::FrameTooLarge {
                size: frame_size,
                max: MAX_FRAME_SIZE,
            });
        }
        let remaining = self.buffer.remaining();
        if len > remaining {
            return Err(BufferError::WriteOverflow {
                requested: len,
                remaining,
            }
            .into());
        }

        let written = message.serialize_into(&mut self.buffer.write_span()[..len])?;
        if written != len {
            return Err(PacketError::LengthMismatch {
                announced: len,
                written,
            });
        }
        self.buffer.commit_write(written)?;
        Ok(())
    }

    /// Write the total frame length into the size field. Called once, after
    /// the last [`append_payload`](Self::append_payload).
    pub fn finalize(&mut self) -> Result<(), PacketError> {
        self.ensure_open()?;
        let size = self.buffer.write_pos();
        let size = u16::try_from(size).map_err(|_| PacketError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        })?;
        self.buffer.head_mut(HEADER_SIZE)[0..2].copy_from_slice(&size.to_le_bytes());
        self.finalized = true;
        Ok(())
    }

    /// Whether the size field has been written.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The parsed header.
    pub fn header(&self) -> PacketHeader {
        let head = &self.buffer.written()[..HEADER_SIZE];
        PacketHeader {
            size: u16::from_le_bytes([head[0], head[1]]),
            protocol: u16::from_le_bytes([head[2], head[3]]),
        }
    }

    /// Protocol id from the header.
    pub fn protocol_id(&self) -> u16 {
        self.header().protocol
    }

    /// Frame size from the header (0 until finalized).
    pub fn declared_size(&self) -> u16 {
        self.header().size
    }

    /// Payload bytes, header excluded.
    pub fn payload(&self) -> &[u8] {
        &self.buffer.written()[HEADER_SIZE..]
    }

    /// The whole frame as it goes on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.written()
    }

    /// Total bytes written, header included.
    pub fn len(&self) -> usize {
        self.buffer.write_pos()
    }

    /// Whether the packet carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len() == HEADER_SIZE
    }

    /// Decode the payload with [`postcard`].
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PacketError> {
        Ok(postcard::from_bytes(self.payload())?)
    }

    fn ensure_open(&self) -> Result<(), PacketError> {
        if self.finalized {
            Err(PacketError::AlreadyFinalized)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("protocol", &self.protocol_id())
            .field("size", &self.declared_size())
            .field("finalized", &self.finalized)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
