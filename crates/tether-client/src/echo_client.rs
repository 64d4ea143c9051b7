//! Echo test client: every connected session sends a random number on an
//! interval and logs the server's echo.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tether_net::{
    ConnectionState, DisconnectReason, DispatchTable, Packet, Session, SessionHandler,
};
use tokio::runtime::Handle;

use crate::protocol::{C2sTestEcho, PacketNumber, S2cTestEcho};

/// Counters shared by every echo session.
#[derive(Debug, Default)]
pub struct EchoStats {
    sent: AtomicU64,
    received: AtomicU64,
    open: AtomicUsize,
}

impl EchoStats {
    /// Packets written to the wire.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Echo replies decoded.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Sessions currently connected.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }
}

/// Session hooks for the echo client.
pub struct EchoClient {
    interval: Duration,
    stats: Arc<EchoStats>,
}

impl EchoClient {
    pub fn new(interval: Duration, stats: Arc<EchoStats>) -> Self {
        Self { interval, stats }
    }
}

impl SessionHandler for EchoClient {
    fn register_handlers(&self, table: &mut DispatchTable) {
        let stats = Arc::clone(&self.stats);
        table.register(
            PacketNumber::TestEcho.id(),
            move |session: &Session, packet: &Packet| match packet.decode::<S2cTestEcho>() {
                Ok(echo) => {
                    stats.received.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        session = %session.id(),
                        server_session = echo.session_id,
                        rand_number = echo.rand_number,
                        "echo received"
                    );
                    true
                }
                Err(e) => {
                    tracing::debug!(session = %session.id(), "undecodable echo: {e}");
                    false
                }
            },
        );
    }

    fn on_connected(&self, session: &Session) {
        self.stats.open.fetch_add(1, Ordering::Relaxed);
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(echo_loop(session.clone(), self.interval));
            }
            Err(e) => tracing::warn!(session = %session.id(), "echo loop not started: {e}"),
        }
    }

    fn on_disconnected(&self, session: &Session, reason: &DisconnectReason) {
        self.stats.open.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!(session = %session.id(), "echo session ended: {reason}");
    }

    fn on_send(&self, session: &Session, packets: usize) {
        self.stats.sent.fetch_add(packets as u64, Ordering::Relaxed);
        tracing::trace!(session = %session.id(), packets, "batch sent");
    }
}

/// Send one [`C2sTestEcho`] per tick until the session goes down.
async fn echo_loop(session: Session, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut state = session.state().subscribe();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let message = C2sTestEcho {
                    rand_number: rand::rng().random_range(0..100),
                };
                if let Err(e) = session.send_message(&message) {
                    tracing::debug!(session = %session.id(), "echo loop stopped: {e}");
                    break;
                }
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ConnectionState::Disconnected {
                    break;
                }
            }
        }
    }
}
