//! The ordered event stream delivered to an application via
//! [`LocalEndPoint::receive`](crate::local::LocalEndPoint::receive).

use bytes::Bytes;

use crate::address::EndPointAddress;
use crate::control::ConnectionId;

/// Reliability requested of a logical connection. `ReliableOrdered` is the
/// only meaningful value (spec.md §6); others are accepted but ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    ReliableOrdered,
    Unreliable,
    Ordered,
}

impl Default for Reliability {
    fn default() -> Self {
        Reliability::ReliableOrdered
    }
}

/// Why a remote was declared lost, or why the whole transport went down.
#[derive(Debug, Clone)]
pub enum ErrorEventKind {
    /// The physical connection to `peer` failed; `incoming` lists every
    /// connection id that was open at that moment (INV-LOST-ONCE).
    ConnectionLost {
        peer: EndPointAddress,
        incoming: Vec<ConnectionId>,
    },
    /// The accept loop died; the transport is now closed.
    TransportFailed { reason: String },
}

/// One item of the ordered event stream (spec.md §3, §7).
#[derive(Debug, Clone)]
pub enum Event {
    /// A new logical connection was opened, either by us (self-connect) or
    /// by a peer issuing `RequestConnectionId`.
    ConnectionOpened(ConnectionId, Reliability, EndPointAddress),
    /// A message arrived on `ConnectionId`. Chunk boundaries only survive a
    /// self-connect; a networked message is always a single chunk, since the
    /// wire format flattens chunks into one length-prefixed blob.
    Received(ConnectionId, Vec<Bytes>),
    /// `ConnectionId` was closed, by us or by the peer.
    ConnectionClosed(ConnectionId),
    /// Something failed asynchronously; delivered at most once per remote
    /// (INV-LOST-ONCE) or once for the whole transport.
    ErrorEvent(ErrorEventKind),
    /// The endpoint that owns this mailbox has closed. No further events
    /// follow; subsequent `receive()` calls return an error instead of
    /// blocking (spec.md §9, Open Question (b)).
    EndPointClosed,
}
