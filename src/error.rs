//! Error taxonomy (spec.md §7): one `thiserror` enum per call surface, plus
//! the framing and address-parsing errors the wire layer can raise.

use thiserror::Error;

/// Errors returned by [`LocalEndPoint::connect`](crate::local::LocalEndPoint::connect).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectErrorCode {
    #[error("peer address did not resolve to a live endpoint")]
    ConnectNotFound,
    #[error("I/O or protocol failure while establishing the connection")]
    ConnectFailed,
    #[error("insufficient local resources to open a connection")]
    ConnectInsufficientResources,
    #[error("connection attempt timed out")]
    ConnectTimeout,
}

/// Errors returned by [`Connection::send`](crate::connection::Connection::send).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SendErrorCode {
    #[error("the peer or the underlying socket failed")]
    SendFailed,
    #[error("the logical connection or its endpoint is already closed")]
    SendClosed,
}

/// Errors returned by [`Transport::new_endpoint`](crate::transport::Transport::new_endpoint).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum NewEndPointErrorCode {
    #[error("the transport has been closed")]
    NewEndPointFailed,
}

/// Malformed bytes on the wire: an EOF before a frame completed, a negative
/// length prefix, or a control header value outside the known set.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FramingError {
    #[error("I/O error while framing: {0}")]
    Io(#[from] std::io::Error),
    #[error("length-prefixed frame carried a negative length")]
    NegativeLength,
    #[error("unknown control header value {0}")]
    UnknownControlHeader(i32),
}

impl From<FramingError> for std::io::Error {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::Io(io_err) => io_err,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressParseError {
    #[error("address bytes were not valid UTF-8")]
    NotUtf8,
    #[error("address did not match host:service:endpoint-id")]
    Malformed,
}

/// Returned by [`LocalEndPoint::receive`](crate::local::LocalEndPoint::receive)
/// once the endpoint has closed (spec.md §9, Open Question (b)).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("the local endpoint is closed")]
pub struct EndPointClosedError;
