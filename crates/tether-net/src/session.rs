//! Session lifecycle: one live connection, its send/receive pipelines and
//! its dispatch table.
//!
//! A [`Session`] is created by the application (usually from the
//! [`Connector`](crate::Connector) factory), then [`init`](Session::init)ed
//! with a connected stream. Init builds the dispatch table through
//! [`SessionHandler::register_handlers`], wires a [`Sender`] to the write half
//! and spawns the [`Receiver`] loop on the read half. Transport errors, an
//! orderly close, unrecoverable framing faults and explicit
//! [`disconnect`](Session::disconnect) calls all converge on one teardown
//! path that runs [`SessionHandler::on_disconnected`] exactly once.
//!
//! The two lifecycle hooks always come as a pair: `on_disconnected` is never
//! delivered before `on_connected` has returned. If the connection drops
//! before the caller gets to [`Session::on_connected`], teardown runs the
//! connected hook itself first; if it drops while `on_connected` is still
//! running, the disconnect is delivered as soon as that hook returns.
//!
//! State changes are broadcast via a [`watch`] channel so any number of
//! consumers can react without polling.

use std::any::type_name;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::framing::{FrameConfig, FrameError};
use crate::packet::{OutboundMessage, Packet, PacketError, Postcard};
use crate::pool::BufferPool;
use crate::protocol::ProtocolTable;
use crate::receiver::{BoxedReader, Receiver};
use crate::routing::{DispatchOutcome, DispatchTable};
use crate::sender::{BoxedWriter, DEFAULT_SEND_BATCH_LIMIT, SendError, SendObserver, Sender};
use crate::traffic::TrafficCounters;

// ---------------------------------------------------------------------------
// Identity and state
// ---------------------------------------------------------------------------

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, no transport attached yet.
    Created,
    /// Transport attached, pipelines being wired.
    Connecting,
    /// Reading and writing.
    Connected,
    /// Torn down. Terminal.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Created`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Created);
        Self { tx, rx }
    }

    fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Current state.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

impl std::fmt::Debug for ConnectionStateWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConnectionStateWatch")
            .field(&self.current())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a session was torn down. Passed to [`SessionHandler::on_disconnected`].
#[derive(Debug, thiserror::Error)]
pub enum DisconnectReason {
    /// The peer closed the connection (a read returned zero bytes).
    #[error("connection closed by peer")]
    Closed,

    /// A read or write failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a frame that can never be parsed.
    #[error("framing fault: {0}")]
    Framing(#[from] FrameError),

    /// A received frame could not be staged into a pooled buffer.
    #[error("resource fault: {0}")]
    Resource(#[from] PacketError),

    /// [`Session::disconnect`] was called.
    #[error("disconnected locally")]
    Local,
}

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session has no transport yet.
    #[error("session is not initialized")]
    NotInitialized,

    /// [`Session::init`] was called twice.
    #[error("session is already initialized")]
    AlreadyInitialized,

    /// The session has been torn down.
    #[error("session is disconnected")]
    Disconnected,

    /// No protocol id is registered for the message type.
    #[error("no protocol id registered for {0}")]
    UnknownMessageType(&'static str),

    /// The packet could not be built.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// The sender refused the packet.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// Init was called outside a tokio runtime.
    #[error("no tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

// ---------------------------------------------------------------------------
// Configuration and hooks
// ---------------------------------------------------------------------------

/// Per-session pipeline settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Packets gathered into one vectored write. Default: 500.
    pub send_batch_limit: usize,
    /// Receive-side frame limits.
    pub frame: FrameConfig,
    /// Pool supplying the receive buffer and every packet buffer.
    pub pool: Arc<BufferPool>,
    /// Totals shared by every session built from clones of this config.
    pub traffic: Arc<TrafficCounters>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_batch_limit: DEFAULT_SEND_BATCH_LIMIT,
            frame: FrameConfig::default(),
            pool: BufferPool::with_default_capacity(),
            traffic: Arc::new(TrafficCounters::new()),
        }
    }
}

/// Application hooks for one kind of session.
///
/// Hooks run on runtime worker threads. Keep them short; heavy work belongs
/// on the application side of a [`PacketQueue`](crate::PacketQueue).
pub trait SessionHandler: Send + Sync + 'static {
    /// Populate the dispatch table. Called once, during [`Session::init`].
    fn register_handlers(&self, table: &mut DispatchTable);

    /// The connection is established and the first read is posted.
    fn on_connected(&self, session: &Session);

    /// The session was torn down. Called exactly once per attached session,
    /// always after `on_connected` has returned.
    fn on_disconnected(&self, session: &Session, reason: &DisconnectReason);

    /// A batch of `packets` finished writing.
    fn on_send(&self, session: &Session, packets: usize);

    /// A complete frame arrived. The default dispatches it inline.
    fn on_packet(&self, session: &Session, packet: Packet) {
        session.dispatch(&packet);
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

// Hook pairing states.
const HOOKS_UNATTACHED: u8 = 0;
/// Attached; `on_connected` not yet run.
const HOOKS_PENDING: u8 = 1;
/// `on_connected` is running.
const HOOKS_CONNECTING: u8 = 2;
/// `on_connected` returned.
const HOOKS_CONNECTED: u8 = 3;
/// Teardown arrived while `on_connected` was running.
const HOOKS_DEFERRED: u8 = 4;
/// Teardown claimed the hooks. Terminal.
const HOOKS_CLOSED: u8 = 5;

struct Link {
    sender: Arc<Sender>,
    remote_addr: SocketAddr,
}

struct SessionInner {
    id: SessionId,
    handler: Arc<dyn SessionHandler>,
    protocols: Arc<ProtocolTable>,
    config: SessionConfig,
    state: ConnectionStateWatch,
    dispatch: OnceLock<DispatchTable>,
    link: OnceLock<Link>,
    disconnected: AtomicBool,
    hooks: AtomicU8,
    reason: OnceLock<DisconnectReason>,
    traffic: TrafficCounters,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to one connection. Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create an unattached session.
    pub fn new(
        handler: Arc<dyn SessionHandler>,
        protocols: Arc<ProtocolTable>,
        config: SessionConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                id: SessionId::next(),
                handler,
                protocols,
                config,
                state: ConnectionStateWatch::new(),
                dispatch: OnceLock::new(),
                link: OnceLock::new(),
                disconnected: AtomicBool::new(false),
                hooks: AtomicU8::new(HOOKS_UNATTACHED),
                reason: OnceLock::new(),
                traffic: TrafficCounters::new(),
                shutdown_tx,
            }),
        }
    }

    /// Attach a connected TCP stream and start both pipelines.
    pub fn init(&self, stream: TcpStream, remote_addr: SocketAddr) -> Result<(), SessionError> {
        let (reader, writer) = stream.into_split();
        self.attach(Box::new(reader), Box::new(writer), remote_addr)
    }

    /// Attach any byte transport and start both pipelines.
    ///
    /// Must be called from within a tokio runtime; the receive loop and send
    /// batches are spawned on it.
    pub fn attach(
        &self,
        reader: BoxedReader,
        writer: BoxedWriter,
        remote_addr: SocketAddr,
    ) -> Result<(), SessionError> {
        let runtime = Handle::try_current()?;
        if self
            .inner
            .hooks
            .compare_exchange(HOOKS_UNATTACHED, HOOKS_PENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(if self.is_disconnected() {
                SessionError::Disconnected
            } else {
                SessionError::AlreadyInitialized
            });
        }
        self.inner.state.set(ConnectionState::Connecting);

        let mut table = DispatchTable::new();
        self.inner.handler.register_handlers(&mut table);
        tracing::debug!(session = %self.id(), handlers = table.len(), "dispatch table built");
        self.inner
            .dispatch
            .set(table)
            .map_err(|_| SessionError::AlreadyInitialized)?;

        let observer = Arc::new(SessionObserver {
            inner: Arc::downgrade(&self.inner),
        });
        let sender = Sender::new(
            writer,
            self.inner.config.send_batch_limit,
            observer,
            runtime.clone(),
        );
        self.inner
            .link
            .set(Link {
                sender,
                remote_addr,
            })
            .map_err(|_| SessionError::AlreadyInitialized)?;

        let receiver = Receiver::new(
            reader,
            self.inner.config.pool.acquire(),
            self.inner.config.frame.clone(),
        );
        let shutdown = self.inner.shutdown_tx.subscribe();
        self.inner.state.set(ConnectionState::Connected);

        let session = self.clone();
        runtime.spawn(async move {
            let pool = Arc::clone(&session.inner.config.pool);
            let reason = receiver
                .run(shutdown, |frame| {
                    let packet = Packet::from_bytes(&pool, frame)?;
                    session.inner.traffic.record_received();
                    session.inner.config.traffic.record_received();
                    session.inner.handler.on_packet(&session, packet);
                    Ok(())
                })
                .await;
            session.close(reason);
        });

        Ok(())
    }

    /// Run [`SessionHandler::on_connected`].
    ///
    /// Runs at most once per session. A no-op before attach, on repeat calls
    /// and after teardown, which delivers the hook itself when it got there
    /// first.
    pub fn on_connected(&self) {
        let hooks = &self.inner.hooks;
        if hooks
            .compare_exchange(HOOKS_PENDING, HOOKS_CONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.inner.handler.on_connected(self);

        if hooks
            .compare_exchange(HOOKS_CONNECTING, HOOKS_CONNECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Torn down while the hook ran; the closer left the rest to us.
            hooks.store(HOOKS_CLOSED, Ordering::Release);
            if let Some(reason) = self.inner.reason.get() {
                self.finish_close(reason);
            }
        }
    }

    /// Send `message` under the protocol id registered for `M`.
    pub fn send<M: OutboundMessage + 'static>(&self, message: &M) -> Result<(), SessionError> {
        let protocol = self.resolve::<M>()?;
        self.send_raw(protocol, message)
    }

    /// Encode `value` with postcard and send it under the protocol id
    /// registered for `T`.
    pub fn send_message<T: Serialize + 'static>(&self, value: &T) -> Result<(), SessionError> {
        let protocol = self.resolve::<T>()?;
        let encoded = Postcard::encode(value)?;
        self.send_raw(protocol, &encoded)
    }

    /// Send `payload` under an explicit protocol id.
    pub fn send_raw<M: OutboundMessage + ?Sized>(
        &self,
        protocol: u16,
        payload: &M,
    ) -> Result<(), SessionError> {
        let sender = self.sender()?;
        let packet = Packet::build(&self.inner.config.pool, protocol, payload)?;
        sender.enqueue(packet)?;
        Ok(())
    }

    /// Queue an already finalized packet.
    pub fn send_packet(&self, packet: Packet) -> Result<(), SessionError> {
        self.sender()?.enqueue(packet)?;
        Ok(())
    }

    /// Run the handler registered for `packet`'s protocol id.
    ///
    /// Unknown ids and failing handlers are logged and dropped; the session
    /// stays up.
    pub fn dispatch(&self, packet: &Packet) -> DispatchOutcome {
        match self.inner.dispatch.get() {
            Some(table) => table.dispatch(self, packet),
            None => {
                tracing::warn!(
                    session = %self.id(),
                    protocol = packet.protocol_id(),
                    "dispatch before init, dropping packet"
                );
                DispatchOutcome::Unhandled
            }
        }
    }

    /// Tear the session down from the application side. Idempotent.
    pub fn disconnect(&self) {
        self.close(DisconnectReason::Local);
    }

    /// Single teardown path. Only the first caller proceeds; the state turns
    /// [`ConnectionState::Disconnected`] once `on_disconnected` has returned.
    fn close(&self, reason: DisconnectReason) {
        if self.inner.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        // Only the first closer gets here, so the slot is empty.
        let _ = self.inner.reason.set(reason);
        let Some(reason) = self.inner.reason.get() else {
            return;
        };
        self.inner.shutdown_tx.send_replace(true);
        if let Some(link) = self.inner.link.get() {
            link.sender.close();
        }

        match reason {
            DisconnectReason::Framing(e) => {
                tracing::error!(session = %self.id(), "framing fault, closing session: {e}");
            }
            DisconnectReason::Io(_) | DisconnectReason::Resource(_) => {
                tracing::warn!(session = %self.id(), "session lost: {reason}");
            }
            DisconnectReason::Closed | DisconnectReason::Local => {
                tracing::info!(session = %self.id(), "session disconnected: {reason}");
            }
        }

        let hooks = &self.inner.hooks;
        loop {
            match hooks.load(Ordering::Acquire) {
                HOOKS_UNATTACHED => {
                    if hooks
                        .compare_exchange(HOOKS_UNATTACHED, HOOKS_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        // Never connected: no hooks to pair.
                        self.inner.state.set(ConnectionState::Disconnected);
                        return;
                    }
                }
                HOOKS_PENDING => {
                    if hooks
                        .compare_exchange(HOOKS_PENDING, HOOKS_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        tracing::debug!(
                            session = %self.id(),
                            "closed before on_connected, delivering it first"
                        );
                        self.inner.handler.on_connected(self);
                        self.finish_close(reason);
                        return;
                    }
                }
                HOOKS_CONNECTING => {
                    if hooks
                        .compare_exchange(HOOKS_CONNECTING, HOOKS_DEFERRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        // `on_connected` delivers the disconnect when it returns.
                        return;
                    }
                }
                HOOKS_CONNECTED => {
                    if hooks
                        .compare_exchange(HOOKS_CONNECTED, HOOKS_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.finish_close(reason);
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn finish_close(&self, reason: &DisconnectReason) {
        self.inner.handler.on_disconnected(self, reason);
        self.inner.state.set(ConnectionState::Disconnected);
    }

    fn resolve<M: 'static>(&self) -> Result<u16, SessionError> {
        self.inner
            .protocols
            .resolve::<M>()
            .ok_or(SessionError::UnknownMessageType(type_name::<M>()))
    }

    fn sender(&self) -> Result<&Arc<Sender>, SessionError> {
        if self.is_disconnected() {
            return Err(SessionError::Disconnected);
        }
        self.inner
            .link
            .get()
            .map(|link| &link.sender)
            .ok_or(SessionError::NotInitialized)
    }

    /// Process-unique id.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Peer address, once initialized.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.link.get().map(|link| link.remote_addr)
    }

    /// Observable lifecycle state.
    pub fn state(&self) -> &ConnectionStateWatch {
        &self.inner.state
    }

    /// Whether teardown has run.
    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::Acquire)
    }

    /// Why the session went down, once it has.
    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.inner.reason.get()
    }

    /// Traffic carried by this session alone.
    pub fn traffic(&self) -> &TrafficCounters {
        &self.inner.traffic
    }

    /// Packets waiting for the next send batch.
    pub fn queued_sends(&self) -> usize {
        self.inner
            .link
            .get()
            .map_or(0, |link| link.sender.queued())
    }

    /// Pool backing this session's buffers.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.inner.config.pool
    }

    /// Protocol table used by [`send`](Self::send).
    pub fn protocols(&self) -> &Arc<ProtocolTable> {
        &self.inner.protocols
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("state", &self.state().current())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

/// Bridges sender events back to the owning session without keeping it alive.
struct SessionObserver {
    inner: Weak<SessionInner>,
}

impl SessionObserver {
    fn session(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl SendObserver for SessionObserver {
    fn on_batch_sent(&self, packets: usize) {
        if let Some(session) = self.session() {
            session.inner.traffic.record_sent(packets);
            session.inner.config.traffic.record_sent(packets);
            session.inner.handler.on_send(&session, packets);
        }
    }

    fn on_send_failed(&self, error: std::io::Error) {
        if let Some(session) = self.session() {
            tracing::warn!(session = %session.id(), "send failed: {error}");
            session.close(DisconnectReason::Io(error));
        }
    }
}

/// Handler with no registrations and empty hooks.
#[cfg(test)]
pub(crate) struct NoopHandler;

#[cfg(test)]
impl SessionHandler for NoopHandler {
    fn register_handlers(&self, _table: &mut DispatchTable) {}
    fn on_connected(&self, _session: &Session) {}
    fn on_disconnected(&self, _session: &Session, _reason: &DisconnectReason) {}
    fn on_send(&self, _session: &Session, _packets: usize) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{read_frame, write_frame};
    use crate::routing::PacketQueue;
    use serde::Deserialize;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

    const ECHO: u16 = 1;
    const REJECT: u16 = 2;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    struct Unregistered;

    impl OutboundMessage for Unregistered {
        fn serialized_len(&self) -> usize {
            0
        }

        fn serialize_into(&self, _buf: &mut [u8]) -> Result<usize, PacketError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        connected: AtomicUsize,
        disconnects: Mutex<Vec<String>>,
        sent: AtomicUsize,
        echoed: Mutex<Vec<Vec<u8>>>,
        queue: Option<PacketQueue>,
    }

    impl SessionHandler for RecordingHandler {
        fn register_handlers(&self, table: &mut DispatchTable) {
            table.register(ECHO, |_: &Session, _: &Packet| true);
            table.register(REJECT, |_: &Session, _: &Packet| false);
        }

        fn on_connected(&self, _session: &Session) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnected(&self, _session: &Session, reason: &DisconnectReason) {
            self.disconnects.lock().unwrap().push(reason.to_string());
        }

        fn on_send(&self, _session: &Session, packets: usize) {
            self.sent.fetch_add(packets, Ordering::SeqCst);
        }

        fn on_packet(&self, session: &Session, packet: Packet) {
            if packet.protocol_id() == ECHO {
                self.echoed.lock().unwrap().push(packet.payload().to_vec());
            }
            match &self.queue {
                Some(queue) => queue.push(packet),
                None => {
                    session.dispatch(&packet);
                }
            }
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:7777".parse().unwrap()
    }

    fn protocols() -> Arc<ProtocolTable> {
        Arc::new(ProtocolTable::new().with::<Ping>(10).with::<Vec<u8>>(11))
    }

    fn attached(handler: Arc<RecordingHandler>) -> (Session, DuplexStream) {
        let (local, peer) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        let config = SessionConfig {
            pool: BufferPool::new(1024),
            ..Default::default()
        };
        let session = Session::new(handler, protocols(), config);
        session
            .attach(Box::new(reader), Box::new(writer), addr())
            .unwrap();
        (session, peer)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_state(session: &Session, state: ConnectionState) {
        let mut rx = session.state().subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_attach_connects_and_builds_table() {
        let handler = Arc::new(RecordingHandler::default());
        let (session, _peer) = attached(Arc::clone(&handler));

        assert_eq!(session.state().current(), ConnectionState::Connected);
        assert_eq!(session.remote_addr(), Some(addr()));
        session.on_connected();
        assert_eq!(handler.connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_new_session_starts_created() {
        let session = Session::new(
            Arc::new(NoopHandler),
            protocols(),
            SessionConfig::default(),
        );
        assert_eq!(session.state().current(), ConnectionState::Created);
        assert_eq!(session.remote_addr(), None);
        assert!(matches!(
            session.send_raw(1, b"early"),
            Err(SessionError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_second_attach_is_rejected() {
        let handler = Arc::new(RecordingHandler::default());
        let (session, _peer) = attached(handler);
        let (local, _other) = duplex(64);
        let (reader, writer) = tokio::io::split(local);

        let result = session.attach(Box::new(reader), Box::new(writer), addr());
        assert!(matches!(result, Err(SessionError::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn test_send_message_resolves_protocol_id() {
        let handler = Arc::new(RecordingHandler::default());
        let (session, mut peer) = attached(Arc::clone(&handler));

        session.send_message(&Ping { seq: 42 }).unwrap();

        let (header, payload) = read_frame(&mut peer, &FrameConfig::default())
            .await
            .unwrap();
        assert_eq!(header.protocol, 10);
        let ping: Ping = postcard::from_bytes(&payload).unwrap();
        assert_eq!(ping, Ping { seq: 42 });

        wait_until(|| handler.sent.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_send_uses_outbound_contract() {
        let (session, mut peer) = attached(Arc::new(RecordingHandler::default()));

        session.send(&vec![1u8, 2, 3]).unwrap();

        let (header, payload) = read_frame(&mut peer, &FrameConfig::default())
            .await
            .unwrap();
        assert_eq!(header.protocol, 11);
        assert_eq!(usize::from(header.size), 7);
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_send_unknown_type_is_rejected() {
        let (session, _peer) = attached(Arc::new(RecordingHandler::default()));
        let result = session.send(&Unregistered);
        assert!(matches!(result, Err(SessionError::UnknownMessageType(_))));
    }

    #[tokio::test]
    async fn test_sends_arrive_in_call_order() {
        let (session, mut peer) = attached(Arc::new(RecordingHandler::default()));
        for seq in 0..20u32 {
            session.send_message(&Ping { seq }).unwrap();
        }

        for seq in 0..20u32 {
            let (_, payload) = read_frame(&mut peer, &FrameConfig::default())
                .await
                .unwrap();
            let ping: Ping = postcard::from_bytes(&payload).unwrap();
            assert_eq!(ping.seq, seq);
        }
    }

    #[tokio::test]
    async fn test_inbound_frame_reaches_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let (_session, mut peer) = attached(Arc::clone(&handler));

        write_frame(&mut peer, ECHO, b"hello", &FrameConfig::default())
            .await
            .unwrap();

        wait_until(|| handler.echoed.lock().unwrap().len() == 1).await;
        assert_eq!(handler.echoed.lock().unwrap()[0], b"hello");
    }

    #[tokio::test]
    async fn test_failed_handler_keeps_session_alive() {
        let handler = Arc::new(RecordingHandler::default());
        let (session, mut peer) = attached(Arc::clone(&handler));
        let config = FrameConfig::default();

        write_frame(&mut peer, REJECT, b"bad", &config).await.unwrap();
        write_frame(&mut peer, 999, b"unknown", &config).await.unwrap();
        write_frame(&mut peer, ECHO, b"good", &config).await.unwrap();

        wait_until(|| handler.echoed.lock().unwrap().len() == 1).await;
        assert_eq!(session.state().current(), ConnectionState::Connected);
        assert!(handler.disconnects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_disconnects_once() {
        let handler = Arc::new(RecordingHandler::default());
        let (session, peer) = attached(Arc::clone(&handler));

        drop(peer);
        wait_for_state(&session, ConnectionState::Disconnected).await;
        session.disconnect();

        let disconnects = handler.disconnects.lock().unwrap();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0], DisconnectReason::Closed.to_string());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let handler = Arc::new(RecordingHandler::default());
        let (session, _peer) = attached(Arc::clone(&handler));

        session.disconnect();
        session.disconnect();
        assert_eq!(session.state().current(), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let disconnects = handler.disconnects.lock().unwrap();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0], DisconnectReason::Local.to_string());
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let (session, _peer) = attached(Arc::new(RecordingHandler::default()));
        session.disconnect();

        assert!(matches!(
            session.send_message(&Ping { seq: 1 }),
            Err(SessionError::Disconnected)
        ));
    }

    /// Records hook order; optionally disconnects from inside `on_connected`.
    #[derive(Default)]
    struct HookOrder {
        events: Mutex<Vec<&'static str>>,
        disconnect_on_connect: bool,
    }

    impl SessionHandler for HookOrder {
        fn register_handlers(&self, _table: &mut DispatchTable) {}

        fn on_connected(&self, session: &Session) {
            self.events.lock().unwrap().push("connected");
            if self.disconnect_on_connect {
                session.disconnect();
                self.events.lock().unwrap().push("connected-returning");
            }
        }

        fn on_disconnected(&self, _session: &Session, _reason: &DisconnectReason) {
            self.events.lock().unwrap().push("disconnected");
        }

        fn on_send(&self, _session: &Session, _packets: usize) {}
    }

    fn attached_with(handler: Arc<HookOrder>) -> (Session, DuplexStream) {
        let (local, peer) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let session = Session::new(handler, protocols(), SessionConfig::default());
        session
            .attach(Box::new(reader), Box::new(writer), addr())
            .unwrap();
        (session, peer)
    }

    #[tokio::test]
    async fn test_peer_close_before_on_connected_keeps_hooks_paired() {
        let handler = Arc::new(HookOrder::default());
        let (session, peer) = attached_with(Arc::clone(&handler));

        drop(peer);
        wait_for_state(&session, ConnectionState::Disconnected).await;
        // The connector reaches its on_connected call only now.
        session.on_connected();

        assert_eq!(*handler.events.lock().unwrap(), vec!["connected", "disconnected"]);
        assert!(matches!(
            session.disconnect_reason(),
            Some(DisconnectReason::Closed)
        ));
    }

    #[tokio::test]
    async fn test_local_disconnect_before_on_connected_keeps_hooks_paired() {
        let handler = Arc::new(RecordingHandler::default());
        let (session, _peer) = attached(Arc::clone(&handler));

        session.disconnect();
        session.on_connected();

        assert_eq!(handler.connected.load(Ordering::SeqCst), 1);
        assert_eq!(handler.disconnects.lock().unwrap().len(), 1);
        assert_eq!(session.state().current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_inside_on_connected_is_delivered_after_it() {
        let handler = Arc::new(HookOrder {
            disconnect_on_connect: true,
            ..Default::default()
        });
        let (session, _peer) = attached_with(Arc::clone(&handler));

        session.on_connected();

        assert_eq!(
            *handler.events.lock().unwrap(),
            vec!["connected", "connected-returning", "disconnected"]
        );
        assert_eq!(session.state().current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_on_connected_runs_once() {
        let handler = Arc::new(RecordingHandler::default());
        let (session, _peer) = attached(Arc::clone(&handler));

        session.on_connected();
        session.on_connected();
        session.disconnect();

        assert_eq!(handler.connected.load(Ordering::SeqCst), 1);
        assert_eq!(handler.disconnects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_of_unattached_session_runs_no_hooks() {
        let handler = Arc::new(HookOrder::default());
        let session = Session::new(
            Arc::clone(&handler) as Arc<dyn SessionHandler>,
            protocols(),
            SessionConfig::default(),
        );

        session.disconnect();
        session.on_connected();

        assert!(handler.events.lock().unwrap().is_empty());
        assert_eq!(session.state().current(), ConnectionState::Disconnected);
        let (local, _peer) = duplex(64);
        let (reader, writer) = tokio::io::split(local);
        assert!(matches!(
            session.attach(Box::new(reader), Box::new(writer), addr()),
            Err(SessionError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_traffic_counted_per_session_and_in_shared_totals() {
        let handler = Arc::new(RecordingHandler::default());
        let shared = Arc::new(TrafficCounters::new());
        let (local, mut peer) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        let session = Session::new(
            Arc::clone(&handler) as Arc<dyn SessionHandler>,
            protocols(),
            SessionConfig {
                pool: BufferPool::new(1024),
                traffic: Arc::clone(&shared),
                ..Default::default()
            },
        );
        session
            .attach(Box::new(reader), Box::new(writer), addr())
            .unwrap();
        let config = FrameConfig::default();

        for _ in 0..3 {
            write_frame(&mut peer, ECHO, b"in", &config).await.unwrap();
        }
        session.send_message(&Ping { seq: 1 }).unwrap();
        session.send_message(&Ping { seq: 2 }).unwrap();
        for _ in 0..2 {
            read_frame(&mut peer, &config).await.unwrap();
        }

        wait_until(|| {
            session.traffic().frames_received() == 3 && session.traffic().packets_sent() == 2
        })
        .await;
        assert_eq!(shared.frames_received(), 3);
        assert_eq!(shared.packets_sent(), 2);
        assert_eq!(shared.accepted(), 0);
    }

    #[tokio::test]
    async fn test_undersized_frame_tears_session_down() {
        let handler = Arc::new(RecordingHandler::default());
        let (session, mut peer) = attached(Arc::clone(&handler));

        peer.write_all(&[0x02, 0x00, 0x01, 0x00]).await.unwrap();
        wait_for_state(&session, ConnectionState::Disconnected).await;

        let disconnects = handler.disconnects.lock().unwrap();
        assert_eq!(disconnects.len(), 1);
        assert!(disconnects[0].starts_with("framing fault"));
    }

    #[tokio::test]
    async fn test_queued_packets_dispatch_on_drain() {
        let queue = PacketQueue::new();
        let handler = Arc::new(RecordingHandler {
            queue: Some(queue.clone()),
            ..Default::default()
        });
        let (session, mut peer) = attached(Arc::clone(&handler));
        let config = FrameConfig::default();

        write_frame(&mut peer, ECHO, b"a", &config).await.unwrap();
        write_frame(&mut peer, REJECT, b"b", &config).await.unwrap();
        wait_until(|| queue.len() == 2).await;

        assert_eq!(queue.drain(&session), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.drain(&session), 0);
    }

    #[tokio::test]
    async fn test_dispatch_before_init_is_dropped() {
        let session = Session::new(
            Arc::new(NoopHandler),
            protocols(),
            SessionConfig::default(),
        );
        let pool = BufferPool::new(64);
        let packet = Packet::build(&pool, 1, b"x").unwrap();
        assert_eq!(session.dispatch(&packet), DispatchOutcome::Unhandled);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert_eq!(format!("{}", SessionId(3)), "#3");
    }
}
