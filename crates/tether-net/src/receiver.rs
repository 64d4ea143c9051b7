//! Inbound pipeline: one read outstanding, frames extracted after each read.
//!
//! The receive loop owns the read half and a pooled [`ByteBuffer`]. Each
//! iteration cleans the buffer, reads into its write span, and runs
//! [`extract_frames`] over everything unread. Consumed bytes are committed;
//! a trailing partial frame stays in the buffer for the next read. The next
//! read is issued only after the previous one has been fully processed.
//!
//! [`ByteBuffer`]: crate::ByteBuffer

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use crate::framing::{FrameConfig, FrameError, extract_frames};
use crate::packet::PacketError;
use crate::pool::PooledBuffer;
use crate::session::DisconnectReason;

/// Read half of a transport, type-erased.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Per-session receive loop.
pub struct Receiver {
    reader: BoxedReader,
    buffer: PooledBuffer,
    frame: FrameConfig,
}

impl Receiver {
    /// Create a receiver reading from `reader` into `buffer`.
    ///
    /// The frame limit is clamped to the buffer capacity: a frame that can
    /// never fit is a framing fault, not a stall.
    pub fn new(reader: BoxedReader, buffer: PooledBuffer, mut frame: FrameConfig) -> Self {
        frame.max_frame_size = frame.max_frame_size.min(buffer.capacity());
        Self {
            reader,
            buffer,
            frame,
        }
    }

    /// Run until the peer closes, an error occurs, or `shutdown` flips to `true`.
    ///
    /// `on_frame` receives each complete frame in arrival order. An error from
    /// it ends the loop as a resource fault. The buffer returns to its pool
    /// when this future completes.
    pub async fn run<F>(mut self, mut shutdown: watch::Receiver<bool>, mut on_frame: F) -> DisconnectReason
    where
        F: FnMut(&[u8]) -> Result<(), PacketError>,
    {
        loop {
            if *shutdown.borrow() {
                return DisconnectReason::Local;
            }

            self.buffer.clean();
            if self.buffer.remaining() == 0 {
                return DisconnectReason::Framing(FrameError::Oversized {
                    size: self.buffer.data_size(),
                    max: self.frame.max_frame_size,
                });
            }

            let read = tokio::select! {
                result = self.reader.read(self.buffer.write_span()) => result,
                _ = shutdown.changed() => return DisconnectReason::Local,
            };

            match read {
                Ok(0) => return DisconnectReason::Closed,
                Err(e) => return DisconnectReason::Io(e),
                Ok(n) => {
                    if let Err(reason) = self.on_read(n, &mut on_frame) {
                        return reason;
                    }
                }
            }
        }
    }

    /// Commit `n` freshly read bytes and deliver every complete frame.
    fn on_read<F>(&mut self, n: usize, on_frame: &mut F) -> Result<(), DisconnectReason>
    where
        F: FnMut(&[u8]) -> Result<(), PacketError>,
    {
        self.buffer
            .commit_write(n)
            .map_err(|e| DisconnectReason::Resource(e.into()))?;

        let mut fault = None;
        let consumed = extract_frames(self.buffer.read_span(), &self.frame, |frame| {
            if fault.is_none()
                && let Err(e) = on_frame(frame)
            {
                fault = Some(e);
            }
        })
        .map_err(DisconnectReason::Framing)?;

        if let Some(e) = fault {
            return Err(DisconnectReason::Resource(e));
        }

        self.buffer
            .commit_read(consumed)
            .map_err(|e| DisconnectReason::Resource(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{HEADER_SIZE, Packet, PacketHeader};
    use crate::pool::BufferPool;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, duplex};

    fn frame(protocol: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = PacketHeader {
            size: (HEADER_SIZE + payload.len()) as u16,
            protocol,
        }
        .encode()
        .to_vec();
        out.extend_from_slice(payload);
        out
    }

    /// Spawn a receiver over a duplex pipe; returns the writer end, the
    /// collected frames, the shutdown switch and the join handle.
    fn spawn_receiver(
        capacity: usize,
    ) -> (
        tokio::io::DuplexStream,
        Arc<std::sync::Mutex<Vec<(u16, Vec<u8>)>>>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<DisconnectReason>,
    ) {
        let pool = BufferPool::new(capacity);
        let (peer, local) = duplex(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let frames = Arc::new(std::sync::Mutex::new(Vec::new()));

        let receiver = Receiver::new(Box::new(local), pool.acquire(), FrameConfig::default());
        let sink = Arc::clone(&frames);
        let frame_pool = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            receiver
                .run(shutdown_rx, move |bytes| {
                    let packet = Packet::from_bytes(&frame_pool, bytes)?;
                    sink.lock()
                        .unwrap()
                        .push((packet.protocol_id(), packet.payload().to_vec()));
                    Ok(())
                })
                .await
        });
        (peer, frames, shutdown_tx, handle)
    }

    async fn wait_for_frames(frames: &std::sync::Mutex<Vec<(u16, Vec<u8>)>>, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while frames.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("frames did not arrive in time");
    }

    #[tokio::test]
    async fn test_documented_example_dispatches_one_frame() {
        let (mut peer, frames, _shutdown, _handle) = spawn_receiver(1024);
        peer.write_all(&[0x06, 0x00, 0x07, 0x00, 0x01, 0x02])
            .await
            .unwrap();

        wait_for_frames(&frames, 1).await;
        assert_eq!(*frames.lock().unwrap(), vec![(7, vec![0x01, 0x02])]);
    }

    #[tokio::test]
    async fn test_pipelined_frames_in_one_write() {
        let (mut peer, frames, _shutdown, _handle) = spawn_receiver(1024);
        let mut stream = Vec::new();
        for i in 0..10u16 {
            stream.extend(frame(i, &[i as u8; 2]));
        }
        peer.write_all(&stream).await.unwrap();

        wait_for_frames(&frames, 10).await;
        let got: Vec<u16> = frames.lock().unwrap().iter().map(|(p, _)| *p).collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_frame_split_across_reads_dispatches_once() {
        let (mut peer, frames, _shutdown, _handle) = spawn_receiver(1024);
        let whole = frame(3, b"split me");

        peer.write_all(&whole[..5]).await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(frames.lock().unwrap().is_empty(), "partial frame must not dispatch");

        peer.write_all(&whole[5..]).await.unwrap();
        wait_for_frames(&frames, 1).await;
        assert_eq!(*frames.lock().unwrap(), vec![(3, b"split me".to_vec())]);
    }

    #[tokio::test]
    async fn test_byte_by_byte_delivery() {
        let (mut peer, frames, _shutdown, _handle) = spawn_receiver(1024);
        let mut stream = frame(1, b"ab");
        stream.extend(frame(2, b"cd"));
        for byte in stream {
            peer.write_all(&[byte]).await.unwrap();
            tokio::task::yield_now().await;
        }

        wait_for_frames(&frames, 2).await;
        assert_eq!(
            *frames.lock().unwrap(),
            vec![(1, b"ab".to_vec()), (2, b"cd".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_zero_byte_read_means_disconnect() {
        let (peer, frames, _shutdown, handle) = spawn_receiver(1024);
        drop(peer);

        let reason = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, DisconnectReason::Closed));
        assert!(frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_data_before_close_is_still_delivered() {
        let (mut peer, frames, _shutdown, handle) = spawn_receiver(1024);
        peer.write_all(&frame(4, b"last words")).await.unwrap();
        drop(peer);

        let reason = handle.await.unwrap();
        assert!(matches!(reason, DisconnectReason::Closed));
        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_undersized_header_is_a_framing_fault() {
        let (mut peer, _frames, _shutdown, handle) = spawn_receiver(1024);
        peer.write_all(&[0x01, 0x00, 0x09, 0x00]).await.unwrap();

        let reason = handle.await.unwrap();
        assert!(matches!(
            reason,
            DisconnectReason::Framing(FrameError::Undersized { size: 1 })
        ));
    }

    #[tokio::test]
    async fn test_frame_larger_than_buffer_is_a_framing_fault() {
        let (mut peer, _frames, _shutdown, handle) = spawn_receiver(32);
        peer.write_all(&[0x40, 0x00, 0x01, 0x00]).await.unwrap();

        let reason = handle.await.unwrap();
        assert!(matches!(
            reason,
            DisconnectReason::Framing(FrameError::Oversized { size: 64, max: 32 })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_the_loop() {
        let (_peer, _frames, shutdown, handle) = spawn_receiver(1024);
        shutdown.send(true).unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, DisconnectReason::Local));
    }

    #[tokio::test]
    async fn test_compaction_keeps_long_streams_flowing() {
        // A small buffer forces many clean() passes with partial frames pending.
        let (mut peer, frames, _shutdown, _handle) = spawn_receiver(64);
        let mut stream = Vec::new();
        for i in 0..200u16 {
            stream.extend(frame(i, &[0xAB; 13]));
        }
        for chunk in stream.chunks(7) {
            peer.write_all(chunk).await.unwrap();
        }

        wait_for_frames(&frames, 200).await;
        let frames = frames.lock().unwrap();
        assert!(frames.iter().enumerate().all(|(i, (p, _))| *p as usize == i));
    }
}
