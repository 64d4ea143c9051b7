//! Echo server: accepts connections, wraps each in a [`Session`] and answers
//! every [`C2sTestEcho`] with the session id and the same number.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tether_net::{
    DisconnectReason, DispatchTable, Packet, ProtocolTable, Session, SessionConfig,
    SessionHandler, SocketConfig, TrafficCounters, configure_stream,
};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::protocol::{C2sTestEcho, PacketNumber, S2cTestEcho, server_protocols};

/// Session hooks for server-side echo sessions.
struct EchoResponder;

impl SessionHandler for EchoResponder {
    fn register_handlers(&self, table: &mut DispatchTable) {
        table.register(
            PacketNumber::TestEcho.id(),
            |session: &Session, packet: &Packet| {
                let Ok(request) = packet.decode::<C2sTestEcho>() else {
                    return false;
                };
                tracing::debug!(session = %session.id(), rand_number = request.rand_number, "echo request");

                let reply = S2cTestEcho {
                    session_id: session.id().0,
                    rand_number: request.rand_number,
                };
                match session.send_message(&reply) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(session = %session.id(), "echo reply failed: {e}");
                        false
                    }
                }
            },
        );
    }

    fn on_connected(&self, _session: &Session) {}

    fn on_disconnected(&self, session: &Session, reason: &DisconnectReason) {
        tracing::info!(session = %session.id(), "Connection closed: {reason}");
    }

    fn on_send(&self, _session: &Session, _packets: usize) {}
}

/// TCP echo server built on client-side sessions.
pub struct EchoServer {
    bind_addr: SocketAddr,
    session_config: SessionConfig,
    socket: SocketConfig,
    protocols: Arc<ProtocolTable>,
    handler: Arc<dyn SessionHandler>,
    sessions: Mutex<Vec<Session>>,
    shutdown_tx: watch::Sender<bool>,
}

impl EchoServer {
    /// Create a server that will bind to `bind_addr`.
    pub fn new(bind_addr: SocketAddr, session_config: SessionConfig, socket: SocketConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bind_addr,
            session_config,
            socket,
            protocols: Arc::new(server_protocols()),
            handler: Arc::new(EchoResponder),
            sessions: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("Echo server listening on {}", listener.local_addr()?);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    ///
    /// Returns after [`shutdown`](Self::shutdown); every live session is
    /// disconnected on the way out.
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = result?;
                    self.session_config.traffic.record_accepted();
                    if let Err(e) = configure_stream(&stream, &self.socket) {
                        tracing::warn!("Rejecting {peer_addr}: {e}");
                        continue;
                    }

                    let session = Session::new(
                        Arc::clone(&self.handler),
                        Arc::clone(&self.protocols),
                        self.session_config.clone(),
                    );
                    if let Err(e) = session.init(stream, peer_addr) {
                        tracing::warn!("Rejecting {peer_addr}: {e}");
                        continue;
                    }
                    tracing::info!(session = %session.id(), "Accepted connection from {peer_addr}");
                    session.on_connected();
                    self.track(session);
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::info!("Echo server shutting down");
        let sessions = match self.sessions.lock() {
            Ok(mut sessions) => std::mem::take(&mut *sessions),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for session in sessions {
            session.disconnect();
        }
        Ok(())
    }

    /// Signal the accept loop to stop.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Accept, receive and send totals across every server session.
    pub fn traffic(&self) -> &Arc<TrafficCounters> {
        &self.session_config.traffic
    }

    /// Sessions still connected.
    pub fn live_sessions(&self) -> usize {
        match self.sessions.lock() {
            Ok(sessions) => sessions.iter().filter(|s| !s.is_disconnected()).count(),
            Err(_) => 0,
        }
    }

    fn track(&self, session: Session) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.retain(|s| !s.is_disconnected());
            sessions.push(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo_client::{EchoClient, EchoStats};
    use crate::protocol::client_protocols;
    use std::time::Duration;
    use tether_net::{BufferPool, Connector, FrameConfig, read_frame, write_frame};
    use tokio::net::TcpStream;

    async fn start_server() -> (Arc<EchoServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(EchoServer::new(
            addr,
            SessionConfig {
                pool: BufferPool::new(4096),
                ..Default::default()
            },
            SocketConfig::default(),
        ));
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run_with_listener(listener).await });
        (server, addr)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_raw_echo_request_gets_reply() {
        let (_server, addr) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let config = FrameConfig::default();

        let request = postcard::to_allocvec(&C2sTestEcho { rand_number: 42 }).unwrap();
        write_frame(&mut stream, PacketNumber::TestEcho.id(), &request, &config)
            .await
            .unwrap();

        let (header, payload) = read_frame(&mut stream, &config).await.unwrap();
        assert_eq!(header.protocol, PacketNumber::TestEcho.id());
        let reply: S2cTestEcho = postcard::from_bytes(&payload).unwrap();
        assert_eq!(reply.rand_number, 42);
        assert!(reply.session_id > 0);
    }

    #[tokio::test]
    async fn test_undecodable_request_is_dropped() {
        let (server, addr) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let config = FrameConfig::default();

        write_frame(&mut stream, PacketNumber::TestEcho.id(), &[0xFF; 8], &config)
            .await
            .unwrap();
        let request = postcard::to_allocvec(&C2sTestEcho { rand_number: 7 }).unwrap();
        write_frame(&mut stream, PacketNumber::TestEcho.id(), &request, &config)
            .await
            .unwrap();

        let (_, payload) = read_frame(&mut stream, &config).await.unwrap();
        let reply: S2cTestEcho = postcard::from_bytes(&payload).unwrap();
        assert_eq!(reply.rand_number, 7);
        assert_eq!(server.live_sessions(), 1);
    }

    #[tokio::test]
    async fn test_echo_client_receives_replies() {
        let (_server, addr) = start_server().await;
        let stats = Arc::new(EchoStats::default());
        let handler: Arc<dyn SessionHandler> = Arc::new(EchoClient::new(
            Duration::from_millis(5),
            Arc::clone(&stats),
        ));
        let protocols = Arc::new(client_protocols());
        let pool = BufferPool::new(4096);

        let sessions = Connector::default()
            .connect(addr, move || {
                Session::new(
                    Arc::clone(&handler),
                    Arc::clone(&protocols),
                    SessionConfig {
                        pool: Arc::clone(&pool),
                        ..Default::default()
                    },
                )
            })
            .await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(stats.open(), 1);

        wait_until(|| stats.received() >= 3).await;
        assert!(stats.sent() >= stats.received());

        sessions[0].disconnect();
        assert_eq!(stats.open(), 0);
    }

    #[tokio::test]
    async fn test_traffic_counts_accepts_and_echoes() {
        let (server, addr) = start_server().await;
        let config = FrameConfig::default();
        let mut streams = Vec::new();
        for _ in 0..2 {
            streams.push(TcpStream::connect(addr).await.unwrap());
        }

        let request = postcard::to_allocvec(&C2sTestEcho { rand_number: 1 }).unwrap();
        for stream in &mut streams {
            write_frame(stream, PacketNumber::TestEcho.id(), &request, &config)
                .await
                .unwrap();
            read_frame(stream, &config).await.unwrap();
        }

        let traffic = Arc::clone(server.traffic());
        wait_until(|| traffic.packets_sent() == 2).await;
        assert_eq!(traffic.accepted(), 2);
        assert_eq!(traffic.frames_received(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_live_sessions() {
        let (server, addr) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        wait_until(|| server.live_sessions() == 1).await;

        server.shutdown();

        // The server side closes: our next read sees EOF.
        let result = read_frame(&mut stream, &FrameConfig::default()).await;
        assert!(result.is_err());
        wait_until(|| server.live_sessions() == 0).await;
    }
}
