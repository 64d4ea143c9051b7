//! Fixed-capacity staging buffer with independent read and write cursors.
//!
//! ```text
//! 0          read_pos          write_pos            capacity
//! |  consumed  |   unread data   |   writable room   |
//! ```
//!
//! The buffer is not a ring: once `write_pos` reaches the end no more bytes
//! fit until [`ByteBuffer::clean`] relocates the unread region to offset 0.

/// Default capacity: room for three maximum-size frames.
pub const DEFAULT_BUFFER_CAPACITY: usize = u16::MAX as usize * 3;

/// Remaining room below which [`ByteBuffer::clean`] compacts live data.
///
/// One maximum-size frame always fits after a compaction.
pub const COMPACT_THRESHOLD: usize = u16::MAX as usize;

/// Errors raised when a cursor would move past its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// A write commit exceeded the writable room.
    #[error("cannot commit {requested} written bytes, only {remaining} remaining")]
    WriteOverflow {
        /// Bytes the caller tried to commit.
        requested: usize,
        /// Writable room left in the buffer.
        remaining: usize,
    },

    /// A read commit exceeded the unread data.
    #[error("cannot commit {requested} read bytes, only {available} available")]
    ReadOverflow {
        /// Bytes the caller tried to consume.
        requested: usize,
        /// Unread bytes currently held.
        available: usize,
    },
}

/// Byte staging area used by packets and the receive path.
///
/// Invariant: `0 <= read_pos <= write_pos <= capacity`.
pub struct ByteBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
}

impl ByteBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Total number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Offset of the first unread byte.
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Offset one past the last written byte.
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Unread bytes: `write_pos - read_pos`.
    pub fn data_size(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Writable room: `capacity - write_pos`.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// The unread region.
    pub fn read_span(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// The unwritten region. Bytes placed here become visible after
    /// [`commit_write`](Self::commit_write).
    pub fn write_span(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// Every byte written so far, including any already consumed.
    pub(crate) fn written(&self) -> &[u8] {
        &self.data[..self.write_pos]
    }

    /// Mutable view of the first `len` bytes, used to patch headers in place.
    pub(crate) fn head_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.data[..len]
    }

    /// Advance `write_pos` by `n`.
    pub fn commit_write(&mut self, n: usize) -> Result<(), BufferError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(BufferError::WriteOverflow {
                requested: n,
                remaining,
            });
        }
        self.write_pos += n;
        Ok(())
    }

    /// Advance `read_pos` by `n`, then [`clean`](Self::clean).
    pub fn commit_read(&mut self, n: usize) -> Result<(), BufferError> {
        let available = self.data_size();
        if n > available {
            return Err(BufferError::ReadOverflow {
                requested: n,
                available,
            });
        }
        self.read_pos += n;
        self.clean();
        Ok(())
    }

    /// Copy `bytes` into the write span and commit them.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let remaining = self.remaining();
        if bytes.len() > remaining {
            return Err(BufferError::WriteOverflow {
                requested: bytes.len(),
                remaining,
            });
        }
        self.write_span()[..bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
        Ok(())
    }

    /// Reclaim consumed space.
    ///
    /// An empty buffer rewinds both cursors to 0. Otherwise, when the writable
    /// room has dropped below [`COMPACT_THRESHOLD`] and some bytes were already
    /// consumed, the unread region is shifted to offset 0.
    pub fn clean(&mut self) {
        let data_size = self.data_size();
        if data_size == 0 {
            self.read_pos = 0;
            self.write_pos = 0;
        } else if self.read_pos > 0 && self.remaining() < COMPACT_THRESHOLD {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = data_size;
        }
    }

    /// Rewind both cursors, discarding any content.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Move the storage out, leaving `self` with zero capacity.
    pub(crate) fn detach(&mut self) -> ByteBuffer {
        let data = std::mem::take(&mut self.data);
        let detached = ByteBuffer {
            data,
            read_pos: self.read_pos,
            write_pos: self.write_pos,
        };
        self.reset();
        detached
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }
}

impl std::fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("capacity", &self.capacity())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .finish()
    }
}
