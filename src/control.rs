//! Control headers and the handshake response codes (spec.md §6).

/// `ConnectionId`s below this value are reserved for [`ControlHeader`]s.
pub const FIRST_NON_RESERVED_CONNECTION_ID: u32 = 1024;

pub type ConnectionId = u32;
pub type ControlRequestId = u32;

/// The leading `int32` of a control frame, always `< 1024`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlHeader {
    RequestConnectionId = 0,
    CloseConnection = 1,
    ControlResponse = 2,
    CloseSocket = 3,
}

impl ControlHeader {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ControlHeader::RequestConnectionId),
            1 => Some(ControlHeader::CloseConnection),
            2 => Some(ControlHeader::ControlResponse),
            3 => Some(ControlHeader::CloseSocket),
            _ => None,
        }
    }
}

/// The response code the listener writes back during the handshake (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRequestResponse {
    Accepted = 0,
    Invalid = 1,
    Crossed = 2,
}

impl ConnectionRequestResponse {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ConnectionRequestResponse::Accepted),
            1 => Some(ConnectionRequestResponse::Invalid),
            2 => Some(ConnectionRequestResponse::Crossed),
            _ => None,
        }
    }
}
