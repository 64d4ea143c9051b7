//! Recycling pool of [`ByteBuffer`]s shared by every session.
//!
//! Buffers are interchangeable, so the free list is a plain lock-free
//! [`crossbeam_channel`] queue. A miss allocates; a release resets the cursors
//! and pushes the buffer back. Nothing is ever freed while the pool lives.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::buffer::{ByteBuffer, DEFAULT_BUFFER_CAPACITY};

/// Concurrent pool of same-capacity buffers.
pub struct BufferPool {
    free_tx: Sender<ByteBuffer>,
    free_rx: Receiver<ByteBuffer>,
    buffer_capacity: usize,
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_capacity` bytes.
    pub fn new(buffer_capacity: usize) -> Arc<Self> {
        let (free_tx, free_rx) = crossbeam_channel::unbounded();
        Arc::new(Self {
            free_tx,
            free_rx,
            buffer_capacity,
            allocated: AtomicUsize::new(0),
        })
    }

    /// Create a pool of [`DEFAULT_BUFFER_CAPACITY`] buffers.
    pub fn with_default_capacity() -> Arc<Self> {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }

    /// Capacity of every buffer this pool hands out.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Take a reset buffer, recycling an idle one when available.
    ///
    /// Never blocks. The buffer returns to this pool when the guard drops.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buffer = match self.free_rx.try_recv() {
            Ok(buffer) => buffer,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(capacity = self.buffer_capacity, "buffer pool miss, allocating");
                ByteBuffer::with_capacity(self.buffer_capacity)
            }
        };

        PooledBuffer {
            buffer,
            pool: Arc::clone(self),
        }
    }

    /// Reset `buffer` and make it available to the next [`acquire`](Self::acquire).
    pub fn release(&self, mut buffer: ByteBuffer) {
        if buffer.capacity() != self.buffer_capacity {
            return;
        }
        buffer.reset();
        // Both channel ends live in `self`, so the send cannot fail.
        let _ = self.free_tx.send(buffer);
    }

    /// Number of buffers ever allocated by this pool.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free_rx.len()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("allocated", &self.allocated())
            .field("idle", &self.idle())
            .finish()
    }
}

/// A [`ByteBuffer`] on loan from a [`BufferPool`].
///
/// Dropping the guard returns the buffer to its pool.
pub struct PooledBuffer {
    buffer: ByteBuffer,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// The pool this buffer will be returned to.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl Deref for PooledBuffer {
    type Target = ByteBuffer;

    fn deref(&self) -> &ByteBuffer {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut ByteBuffer {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(self.buffer.detach());
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.buffer.fmt(f)
    }
}
