//! The `Connection` handle returned by [`LocalEndPoint::connect`](crate::local::LocalEndPoint::connect)
//! (spec.md §3, §4.8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::control::ConnectionId;
use crate::error::SendErrorCode;
use crate::event::Event;
use crate::local::LocalShared;
use crate::remote::RemoteEndPoint;

enum Target {
    Remote(Arc<RemoteEndPoint>),
    SelfLoop,
}

/// A logical, ordered, reliable byte stream multiplexed over a peer's
/// physical TCP connection (or, for a self-connect, a direct loopback into
/// the owning endpoint's own mailbox).
pub struct Connection {
    local: Arc<LocalShared>,
    conn_id: ConnectionId,
    target: Target,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn networked(local: Arc<LocalShared>, remote: Arc<RemoteEndPoint>, conn_id: ConnectionId) -> Self {
        Connection {
            local,
            conn_id,
            target: Target::Remote(remote),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn self_loop(local: Arc<LocalShared>, conn_id: ConnectionId) -> Self {
        Connection {
            local,
            conn_id,
            target: Target::SelfLoop,
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn_id
    }

    /// Sends `chunks` as one ordered message (spec.md §4.1: chunk boundaries
    /// only survive a self-connect).
    pub async fn send(&self, chunks: Vec<Bytes>) -> Result<(), SendErrorCode> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendErrorCode::SendClosed);
        }
        match &self.target {
            Target::Remote(remote) => self.local.send(remote, self.conn_id, &chunks).await,
            Target::SelfLoop => {
                self.local.post_event(Event::Received(self.conn_id, chunks));
                Ok(())
            }
        }
    }

    /// Idempotent: a second call on an already-closed connection is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.target {
            Target::Remote(remote) => self.local.close_connection(remote, self.conn_id).await,
            Target::SelfLoop => self.local.post_event(Event::ConnectionClosed(self.conn_id)),
        }
    }
}
