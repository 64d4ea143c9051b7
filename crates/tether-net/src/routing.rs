//! Packet routing: dispatch inbound packets to handlers by protocol id.
//!
//! A [`DispatchTable`] is filled once per session by
//! [`SessionHandler::register_handlers`](crate::SessionHandler::register_handlers)
//! and is read-only afterwards. Applications that want handlers to run on
//! their own thread push packets into a [`PacketQueue`] from
//! [`SessionHandler::on_packet`](crate::SessionHandler::on_packet) and drain
//! it once per tick with [`PacketQueue::drain`].

use std::collections::HashMap;

use crate::packet::Packet;
use crate::session::Session;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Handles every packet carrying one protocol id.
pub trait PacketHandler: Send + Sync {
    /// Process one packet. Returns `false` if the packet could not be handled;
    /// the packet is then logged and dropped, the session stays up.
    fn handle(&self, session: &Session, packet: &Packet) -> bool;
}

/// Blanket implementation for closures.
impl<F> PacketHandler for F
where
    F: Fn(&Session, &Packet) -> bool + Send + Sync,
{
    fn handle(&self, session: &Session, packet: &Packet) -> bool {
        self(session, packet)
    }
}

/// Result of dispatching one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran and reported success.
    Handled,
    /// No handler is registered for the protocol id.
    Unhandled,
    /// The handler reported failure.
    Failed,
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Protocol id to handler mapping.
#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<u16, Box<dyn PacketHandler>>,
}

impl DispatchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `protocol`. A second registration for the same
    /// id replaces the first.
    pub fn register<H: PacketHandler + 'static>(&mut self, protocol: u16, handler: H) -> &mut Self {
        if self.handlers.insert(protocol, Box::new(handler)).is_some() {
            tracing::debug!(protocol, "replaced packet handler");
        }
        self
    }

    /// Run the handler registered for `packet`'s protocol id.
    ///
    /// Unknown ids and failing handlers are logged and absorbed.
    pub fn dispatch(&self, session: &Session, packet: &Packet) -> DispatchOutcome {
        let protocol = packet.protocol_id();
        let Some(handler) = self.handlers.get(&protocol) else {
            tracing::warn!(
                session = %session.id(),
                protocol,
                "no handler registered, dropping packet"
            );
            return DispatchOutcome::Unhandled;
        };

        if handler.handle(session, packet) {
            DispatchOutcome::Handled
        } else {
            tracing::warn!(
                session = %session.id(),
                protocol,
                size = packet.len(),
                "handler failed, dropping packet"
            );
            DispatchOutcome::Failed
        }
    }

    /// Whether a handler exists for `protocol`.
    pub fn contains(&self, protocol: u16) -> bool {
        self.handlers.contains_key(&protocol)
    }

    /// Registered protocol ids (useful for startup logging).
    pub fn registered_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.handlers.keys().copied()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<u16> = self.registered_ids().collect();
        ids.sort_unstable();
        f.debug_struct("DispatchTable").field("ids", &ids).finish()
    }
}

// ---------------------------------------------------------------------------
// Inbound queue
// ---------------------------------------------------------------------------

/// Unbounded queue carrying received packets from network tasks to the
/// application thread.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct PacketQueue {
    tx: crossbeam_channel::Sender<Packet>,
    rx: crossbeam_channel::Receiver<Packet>,
}

impl PacketQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Push a packet. Never blocks.
    pub fn push(&self, packet: Packet) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(packet);
    }

    /// Pop the oldest packet, if any.
    pub fn try_pop(&self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }

    /// Packets waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Dispatch every packet queued so far through `session`'s table.
    ///
    /// Packets pushed while draining wait for the next call. Returns the
    /// number of packets processed.
    pub fn drain(&self, session: &Session) -> usize {
        let pending = self.rx.len();
        let mut processed = 0;
        while processed < pending {
            let Some(packet) = self.try_pop() else {
                break;
            };
            session.dispatch(&packet);
            processed += 1;
        }
        processed
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketQueue")
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
