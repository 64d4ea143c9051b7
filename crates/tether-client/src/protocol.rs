//! Test protocol shared by the echo client and the echo server.

use serde::{Deserialize, Serialize};
use tether_net::ProtocolTable;

/// Wire protocol ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketNumber {
    /// Client sends a number, server answers with it and its session id.
    TestEcho = 1,
}

impl PacketNumber {
    /// Numeric id carried in the frame header.
    pub const fn id(self) -> u16 {
        self as u16
    }
}

/// Client to server echo request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct C2sTestEcho {
    pub rand_number: i32,
}

/// Server to client echo reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S2cTestEcho {
    /// Id of the server-side session that answered.
    pub session_id: u64,
    pub rand_number: i32,
}

/// Outbound ids used by the client.
pub fn client_protocols() -> ProtocolTable {
    ProtocolTable::new().with::<C2sTestEcho>(PacketNumber::TestEcho.id())
}

/// Outbound ids used by the echo server.
pub fn server_protocols() -> ProtocolTable {
    ProtocolTable::new().with::<S2cTestEcho>(PacketNumber::TestEcho.id())
}
