//! Outbound packet pipeline: one queue and at most one write in flight.
//!
//! [`Sender::enqueue`] pushes onto an unbounded FIFO and tries to flip the
//! in-flight flag from idle to sending. The caller that wins the flip spawns
//! the batch task; everyone else leaves their packet for that task to pick
//! up. The task drains up to `batch_limit` packets per vectored write, reports
//! the batch to the [`SendObserver`] and keeps going until the queue is empty.

use std::io::IoSlice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::Mutex;

use crate::packet::Packet;

/// Default number of packets gathered into one write.
pub const DEFAULT_SEND_BATCH_LIMIT: usize = 500;

/// Write half of a transport, type-erased.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors returned by [`Sender::enqueue`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The sender has shut down after a failure or a disconnect.
    #[error("sender is closed")]
    Closed,

    /// The packet's size field was never written.
    #[error("packet not finalized")]
    NotFinalized,
}

/// Receives batch completion events from a [`Sender`].
pub trait SendObserver: Send + Sync + 'static {
    /// A batch of `packets` was fully written. Their buffers are back in the pool.
    fn on_batch_sent(&self, packets: usize);

    /// A write failed. The sender is closed and its queue dropped.
    fn on_send_failed(&self, error: std::io::Error);
}

/// Per-session outbound queue and batch writer.
pub struct Sender {
    queue_tx: crossbeam_channel::Sender<Packet>,
    queue_rx: crossbeam_channel::Receiver<Packet>,
    sending: AtomicBool,
    closed: AtomicBool,
    write_shut: AtomicBool,
    writer: Mutex<BoxedWriter>,
    batch_limit: usize,
    observer: Arc<dyn SendObserver>,
    runtime: Handle,
}

impl Sender {
    /// Create a sender writing to `writer`. Batch tasks are spawned on `runtime`.
    pub fn new(
        writer: BoxedWriter,
        batch_limit: usize,
        observer: Arc<dyn SendObserver>,
        runtime: Handle,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        Arc::new(Self {
            queue_tx,
            queue_rx,
            sending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            write_shut: AtomicBool::new(false),
            writer: Mutex::new(writer),
            batch_limit: batch_limit.max(1),
            observer,
            runtime,
        })
    }

    /// Queue a finalized packet and start a batch if none is in flight.
    ///
    /// Safe to call from any thread.
    pub fn enqueue(self: &Arc<Self>, packet: Packet) -> Result<(), SendError> {
        if !packet.is_finalized() {
            return Err(SendError::NotFinalized);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.queue_tx.send(packet).map_err(|_| SendError::Closed)?;
        self.try_begin();
        Ok(())
    }

    /// Packets waiting for a batch.
    pub fn queued(&self) -> usize {
        self.queue_rx.len()
    }

    /// Whether a batch task currently owns the writer.
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    /// Whether the sender refuses new packets.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse further packets, drop the queue and shut the write half down.
    ///
    /// Safe to call after a failed write already closed the sender; the
    /// write half is shut down once either way.
    pub fn close(self: &Arc<Self>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.discard_queue();
        }
        self.shutdown_writer();
    }

    /// Whether the write half has been shut down (or its shutdown is queued).
    pub fn is_write_shut(&self) -> bool {
        self.write_shut.load(Ordering::Acquire)
    }

    fn shutdown_writer(self: &Arc<Self>) {
        if self.write_shut.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let mut writer = this.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("write half shutdown failed: {e}");
            }
        });
    }

    fn try_begin(self: &Arc<Self>) {
        if self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let this = Arc::clone(self);
            self.runtime.spawn(async move { this.run_batches().await });
        }
    }

    /// Batch loop. Runs only while `sending` is held.
    async fn run_batches(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                self.discard_queue();
                self.sending.store(false, Ordering::Release);
                return;
            }

            let batch = self.take_batch();
            if batch.is_empty() {
                self.sending.store(false, Ordering::Release);
                // A packet queued after `take_batch` saw the queue empty but
                // before the flag cleared would otherwise be stranded.
                if self.queue_rx.is_empty()
                    || self
                        .sending
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                {
                    return;
                }
                continue;
            }

            let count = batch.len();
            match self.write_batch(&batch).await {
                Ok(()) => {
                    drop(batch);
                    tracing::trace!(packets = count, "send batch complete");
                    self.observer.on_batch_sent(count);
                }
                Err(e) => {
                    drop(batch);
                    self.closed.store(true, Ordering::Release);
                    self.discard_queue();
                    self.sending.store(false, Ordering::Release);
                    tracing::warn!(packets = count, "send batch failed: {e}");
                    self.shutdown_writer();
                    self.observer.on_send_failed(e);
                    return;
                }
            }
        }
    }

    fn take_batch(&self) -> Vec<Packet> {
        let mut batch = Vec::new();
        while batch.len() < self.batch_limit {
            match self.queue_rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }
        batch
    }

    async fn write_batch(&self, batch: &[Packet]) -> std::io::Result<()> {
        let mut slices: Vec<IoSlice<'_>> =
            batch.iter().map(|p| IoSlice::new(p.as_bytes())).collect();
        let mut bufs = slices.as_mut_slice();

        let mut writer = self.writer.lock().await;
        while !bufs.is_empty() {
            let n = writer.write_vectored(bufs).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
            IoSlice::advance_slices(&mut bufs, n);
        }
        writer.flush().await
    }

    fn discard_queue(&self) {
        while self.queue_rx.try_recv().is_ok() {}
    }
}
