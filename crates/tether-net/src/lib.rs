//! Asynchronous TCP client sessions: pooled buffers, length-prefixed framing,
//! ordered batched sends and protocol-id dispatch.
//!
//! Wire format, per frame (little-endian):
//!
//! ```text
//! offset 0..2 : u16 total frame size, header included
//! offset 2..4 : u16 protocol id
//! offset 4..N : payload
//! ```
//!
//! The usual flow is [`Connector::connect`] → [`Session::init`] → the
//! [`Receiver`] loop feeding [`Session::dispatch`], with outbound messages
//! going [`Session::send`] → [`Sender`] → one vectored write per batch.

pub mod buffer;
pub mod connector;
pub mod framing;
pub mod packet;
pub mod platform;
pub mod pool;
pub mod protocol;
pub mod receiver;
pub mod routing;
pub mod sender;
pub mod session;
pub mod traffic;

pub use buffer::{BufferError, ByteBuffer, COMPACT_THRESHOLD, DEFAULT_BUFFER_CAPACITY};
pub use connector::{ConnectError, Connector, ConnectorConfig};
pub use framing::{FrameConfig, FrameError, extract_frames, read_frame, write_frame};
pub use packet::{
    HEADER_SIZE, MAX_FRAME_SIZE, OutboundMessage, Packet, PacketError, PacketHeader, Postcard,
};
pub use platform::{SocketConfig, configure_stream};
pub use pool::{BufferPool, PooledBuffer};
pub use protocol::ProtocolTable;
pub use receiver::{BoxedReader, Receiver};
pub use routing::{DispatchOutcome, DispatchTable, PacketHandler, PacketQueue};
pub use sender::{BoxedWriter, DEFAULT_SEND_BATCH_LIMIT, SendError, SendObserver, Sender};
pub use session::{
    ConnectionState, ConnectionStateWatch, DisconnectReason, Session, SessionConfig,
    SessionError, SessionHandler, SessionId,
};
pub use traffic::{TrafficCounters, TrafficMeter, TrafficRates, TrafficSnapshot};
