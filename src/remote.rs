//! The remote-endpoint state machine (spec.md §3, §4.4-§4.8): the per-peer
//! physical connection, its state, and the invariants around send/receive
//! and the graceful two-way close.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, MutexGuard};

use crate::address::EndPointAddress;
use crate::codec;
use crate::control::{ConnectionId, ControlHeader, ControlRequestId};
use crate::error::{ConnectErrorCode, SendErrorCode};
use crate::local::LocalShared;
use crate::signal::ResolveSignal;

static NEXT_REMOTE_ID: AtomicU64 = AtomicU64::new(1);

/// Which side initiated an `Init` remote: ours (`connect()`) or the peer's
/// (an inbound accept).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Local,
    Remote,
}

pub(crate) struct ValidState {
    pub(crate) outgoing: u32,
    pub(crate) incoming: HashSet<ConnectionId>,
    writer: OwnedWriteHalf,
}

enum RemoteState {
    Invalid(ConnectErrorCode),
    Init {
        origin: Origin,
        resolved: Arc<ResolveSignal>,
    },
    Valid(ValidState),
    Closing {
        resolved: Arc<ResolveSignal>,
        snapshot: ValidState,
    },
    Closed,
}

/// Outcome of finding an existing entry in the local endpoint's `remotes` map.
pub(crate) enum FoundOutcome {
    BumpedValid,
    WaitThenRetry(Arc<ResolveSignal>),
    /// The state was `Closed`; under INV-CLOSE-THEN-UNLINK it should already
    /// have been removed, but a caller may still observe it mid-removal;
    /// treat as absent and retry.
    RetryAsAbsent,
    Invalid(ConnectErrorCode),
    AlreadyConnected,
}

/// What happened when we received `CloseSocket` from the peer (spec.md §4.8).
pub(crate) enum CloseSocketOutcome {
    /// We had no outgoing left either: we agreed, sent a reciprocal
    /// `CloseSocket`, and are now `Closed`. Carries the incoming ids that
    /// were drained (each needs a `ConnectionClosed` event) and tells the
    /// reader loop to exit.
    WeAgree(Vec<ConnectionId>),
    /// We still have outgoing connections open: stay `Valid`, drained
    /// incoming ids still need `ConnectionClosed` events, reader keeps going.
    WeStayOpen(Vec<ConnectionId>),
    /// We were `Closing` and this is the peer's ack: reader exits, no event.
    PeerAcked,
    /// Protocol violation: `CloseSocket` arrived while `Init`/`Invalid`/`Closed`.
    Violation,
}

/// What happened on a read error or framing error (spec.md §4.6, "On premature exit").
pub(crate) enum FailOutcome {
    WasValid(Vec<ConnectionId>),
    WasClosing,
    /// `Init`/`Invalid`/`Closed` observed: nothing to unwind, by RELY this
    /// reader shouldn't have been running against this state at all.
    Unchanged,
}

pub(crate) struct RemoteEndPoint {
    pub(crate) peer: EndPointAddress,
    pub(crate) local_id: u64,
    local: Weak<LocalShared>,
    state: Mutex<RemoteState>,
}

impl fmt::Debug for RemoteEndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndPoint")
            .field("peer", &self.peer)
            .field("local_id", &self.local_id)
            .finish()
    }
}

fn encode_control(header: ControlHeader, value: i32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(header as i32).to_be_bytes());
    out[4..8].copy_from_slice(&value.to_be_bytes());
    out
}

fn encode_close_socket() -> [u8; 4] {
    (ControlHeader::CloseSocket as i32).to_be_bytes()
}

impl RemoteEndPoint {
    /// Creates a fresh `Init` entry and returns it along with the resolved
    /// signal the creator should fire once the attempt settles.
    pub(crate) fn new_init(
        peer: EndPointAddress,
        origin: Origin,
        local: Weak<LocalShared>,
    ) -> (Arc<Self>, Arc<ResolveSignal>) {
        let resolved = Arc::new(ResolveSignal::new());
        let remote = Arc::new(RemoteEndPoint {
            peer,
            local_id: NEXT_REMOTE_ID.fetch_add(1, Ordering::Relaxed),
            local,
            state: Mutex::new(RemoteState::Init {
                origin,
                resolved: resolved.clone(),
            }),
        });
        (remote, resolved)
    }

    /// Removes this entry from the owning local endpoint's map, but only if
    /// it is still the current occupant for `peer` (guards against a fresh
    /// remote having already replaced an evicted one, the `local_id` check
    /// spec.md §3 calls for).
    fn unlink_from_local(&self) {
        if let Some(local) = self.local.upgrade() {
            local.remove_remote_if_current(&self.peer, self.local_id);
        }
    }

    /// Inspects an existing entry found under the local lock (spec.md §4.5
    /// step 1). `requester_origin` is the origin of the *new* request being
    /// resolved against this entry.
    pub(crate) async fn on_found(&self, requester_origin: Origin) -> FoundOutcome {
        let mut guard = self.state.lock().await;
        match &mut *guard {
            RemoteState::Valid(v) => {
                v.outgoing += 1;
                FoundOutcome::BumpedValid
            }
            RemoteState::Init { origin, resolved } => {
                if *origin == Origin::Remote && requester_origin == Origin::Remote {
                    FoundOutcome::AlreadyConnected
                } else {
                    FoundOutcome::WaitThenRetry(resolved.clone())
                }
            }
            RemoteState::Closing { resolved, .. } => FoundOutcome::WaitThenRetry(resolved.clone()),
            RemoteState::Invalid(err) => FoundOutcome::Invalid(*err),
            RemoteState::Closed => FoundOutcome::RetryAsAbsent,
        }
    }

    /// As [`Self::on_found`], but for the inbound accept path (spec.md
    /// §4.4): never waits. The accept handler itself is the one that will
    /// resolve an `Init` entry it finds here, via the crossed tiebreak.
    pub(crate) async fn peek_for_inbound(&self) -> InboundFound {
        let guard = self.state.lock().await;
        match &*guard {
            RemoteState::Init { .. } => InboundFound::Init,
            RemoteState::Valid(_) => InboundFound::AlreadyValid,
            RemoteState::Closing { .. } => InboundFound::Busy,
            RemoteState::Invalid(err) => InboundFound::Invalid(*err),
            RemoteState::Closed => InboundFound::RetryAsAbsent,
        }
    }

    /// Publishes `Valid` for a freshly-accepted or freshly-connected socket
    /// and fires `resolved` (INV-RESOLVE-ONCE: state publishes before the
    /// signal fires).
    pub(crate) async fn publish_valid(
        &self,
        writer: OwnedWriteHalf,
        outgoing: u32,
        resolved: &ResolveSignal,
    ) {
        {
            let mut guard = self.state.lock().await;
            *guard = RemoteState::Valid(ValidState {
                outgoing,
                incoming: HashSet::new(),
                writer,
            });
        }
        resolved.fire();
    }

    /// Publishes `Invalid(err)`, unlinking from the local map first
    /// (INV-CLOSE-THEN-UNLINK's spirit applies to any terminal-ish publish
    /// that should no longer be discoverable by address).
    pub(crate) async fn publish_invalid(&self, err: ConnectErrorCode, resolved: &ResolveSignal) {
        self.unlink_from_local();
        {
            let mut guard = self.state.lock().await;
            *guard = RemoteState::Invalid(err);
        }
        resolved.fire();
    }

    /// If still `Init`, force it to `Invalid` with no resolved reference at
    /// hand (used when a handshake write itself fails before we ever created
    /// a resolved-signal handle locally, e.g. the accept path).
    pub(crate) async fn force_invalid_if_init(&self, err: ConnectErrorCode) {
        let mut guard = self.state.lock().await;
        if let RemoteState::Init { resolved, .. } = &*guard {
            let resolved = resolved.clone();
            self.unlink_from_local();
            *guard = RemoteState::Invalid(err);
            drop(guard);
            resolved.fire();
        }
    }

    /// Increments `outgoing` for a connect attempt that just resolved this
    /// remote to `Valid` (spec.md §4.5), whether directly accepted or
    /// settled via the crossed tiebreak. A no-op if the remote moved on to
    /// some other state in the meantime.
    pub(crate) async fn bump_outgoing(&self) {
        let mut guard = self.state.lock().await;
        if let RemoteState::Valid(v) = &mut *guard {
            v.outgoing += 1;
        }
    }

    /// §4.7 step 2: send `[header, reqId]`, requires `Valid`.
    pub(crate) async fn send_control_request(
        &self,
        header: ControlHeader,
        req_id: ControlRequestId,
    ) -> Result<(), SendErrorCode> {
        let mut guard = self.state.lock().await;
        match &mut *guard {
            RemoteState::Valid(v) => {
                let frame = encode_control(header, req_id as i32);
                codec::send_many(&mut v.writer, &[&frame])
                    .await
                    .map_err(|_| SendErrorCode::SendFailed)
            }
            _ => Err(SendErrorCode::SendClosed),
        }
    }

    /// Sends a data frame: `int32 connId` then the flattened, length-prefixed payload.
    pub(crate) async fn send_data(
        &self,
        conn_id: ConnectionId,
        chunks: &[bytes::Bytes],
    ) -> Result<(), SendErrorCode> {
        let mut guard = self.state.lock().await;
        match &mut *guard {
            RemoteState::Valid(v) => {
                codec::send_int32(&mut v.writer, conn_id as i32)
                    .await
                    .map_err(|_| SendErrorCode::SendFailed)?;
                codec::send_message(&mut v.writer, chunks)
                    .await
                    .map_err(|_| SendErrorCode::SendFailed)
            }
            _ => Err(SendErrorCode::SendClosed),
        }
    }

    /// §4.6 `RequestConnectionId` handling: allocate `c` into `incoming`,
    /// reply, and, if we were `Closing`, promote back to `Valid`, firing
    /// the now-cancelled close's resolved signal (the peer implicitly
    /// refused our `CloseSocket`).
    pub(crate) async fn accept_incoming_connection(
        &self,
        req_id: ControlRequestId,
        conn_id: ConnectionId,
    ) -> Result<(), SendErrorCode> {
        let mut guard = self.state.lock().await;
        match &mut *guard {
            RemoteState::Valid(v) => {
                v.incoming.insert(conn_id);
                send_control_response_via(&mut v.writer, req_id, &(conn_id as i32).to_be_bytes())
                    .await
            }
            RemoteState::Closing { .. } => {
                let taken = std::mem::replace(&mut *guard, RemoteState::Closed);
                let (resolved, mut snapshot) = match taken {
                    RemoteState::Closing { resolved, snapshot } => (resolved, snapshot),
                    _ => unreachable!(),
                };
                snapshot.incoming.insert(conn_id);
                let result =
                    send_control_response_via(&mut snapshot.writer, req_id, &(conn_id as i32).to_be_bytes())
                        .await;
                *guard = RemoteState::Valid(snapshot);
                drop(guard);
                resolved.fire();
                result
            }
            _ => Err(SendErrorCode::SendFailed),
        }
    }

    /// §4.8 `close()`: decrement `outgoing`, best-effort `CloseConnection`,
    /// then evaluate `close-if-unused`.
    pub(crate) async fn close_logical_connection(
        &self,
        conn_id: ConnectionId,
    ) -> Result<(), SendErrorCode> {
        let mut guard = self.state.lock().await;
        if !matches!(&*guard, RemoteState::Valid(_)) {
            return Err(SendErrorCode::SendClosed);
        }
        if let RemoteState::Valid(v) = &mut *guard {
            v.outgoing = v.outgoing.saturating_sub(1);
        }
        let frame = encode_control(ControlHeader::CloseConnection, conn_id as i32);
        if let RemoteState::Valid(v) = &mut *guard {
            if let Err(e) = codec::send_many(&mut v.writer, &[&frame]).await {
                log::warn!("best-effort CloseConnection to {} failed: {e}", self.peer);
            }
        }
        self.close_if_unused_locked(&mut guard).await;
        Ok(())
    }

    /// §4.6 `CloseConnection` handling: remove `c` from `incoming`, then
    /// evaluate `close-if-unused`. Returns whether `c` was actually present
    /// (RELY: it must be).
    pub(crate) async fn remove_incoming(&self, conn_id: ConnectionId) -> bool {
        let mut guard = self.state.lock().await;
        let present = if let RemoteState::Valid(v) = &mut *guard {
            v.incoming.remove(&conn_id)
        } else {
            false
        };
        self.close_if_unused_locked(&mut guard).await;
        present
    }

    async fn close_if_unused_locked(&self, guard: &mut MutexGuard<'_, RemoteState>) {
        let should_close = matches!(&**guard, RemoteState::Valid(v) if v.outgoing == 0 && v.incoming.is_empty());
        if !should_close {
            return;
        }
        if let RemoteState::Valid(v) = &mut **guard {
            let frame = encode_close_socket();
            let _ = codec::send_many(&mut v.writer, &[&frame]).await;
        }
        let taken = std::mem::replace(&mut **guard, RemoteState::Closed);
        if let RemoteState::Valid(v) = taken {
            **guard = RemoteState::Closing {
                resolved: Arc::new(ResolveSignal::new()),
                snapshot: v,
            };
        }
    }

    /// §4.8 receiving `CloseSocket`.
    pub(crate) async fn handle_close_socket(&self) -> CloseSocketOutcome {
        let mut guard = self.state.lock().await;
        match &mut *guard {
            RemoteState::Valid(v) => {
                let drained: Vec<ConnectionId> = v.incoming.drain().collect();
                if v.outgoing == 0 {
                    let frame = encode_close_socket();
                    let _ = codec::send_many(&mut v.writer, &[&frame]).await;
                    self.unlink_from_local();
                    *guard = RemoteState::Closed;
                    CloseSocketOutcome::WeAgree(drained)
                } else {
                    CloseSocketOutcome::WeStayOpen(drained)
                }
            }
            RemoteState::Closing { resolved, .. } => {
                let resolved = resolved.clone();
                self.unlink_from_local();
                *guard = RemoteState::Closed;
                drop(guard);
                resolved.fire();
                CloseSocketOutcome::PeerAcked
            }
            _ => CloseSocketOutcome::Violation,
        }
    }

    /// §4.6 "On premature exit" (I/O error or framing error in the reader loop).
    pub(crate) async fn fail(&self) -> FailOutcome {
        let mut guard = self.state.lock().await;
        match std::mem::replace(&mut *guard, RemoteState::Closed) {
            RemoteState::Valid(v) => {
                self.unlink_from_local();
                FailOutcome::WasValid(v.incoming.into_iter().collect())
            }
            RemoteState::Closing { resolved, .. } => {
                self.unlink_from_local();
                drop(guard);
                resolved.fire();
                FailOutcome::WasClosing
            }
            other @ (RemoteState::Init { .. } | RemoteState::Invalid(_) | RemoteState::Closed) => {
                *guard = other;
                FailOutcome::Unchanged
            }
        }
    }

    /// What a connect-in-progress waiter sees after its resolved signal fires.
    pub(crate) async fn snapshot_outcome(&self) -> ConnectOutcome {
        let guard = self.state.lock().await;
        match &*guard {
            RemoteState::Valid(_) => ConnectOutcome::Valid,
            RemoteState::Invalid(err) => ConnectOutcome::Invalid(*err),
            RemoteState::Init { .. } | RemoteState::Closing { .. } => ConnectOutcome::StillPending,
            RemoteState::Closed => ConnectOutcome::Closed,
        }
    }

    /// The resolved signal currently associated with an `Init` entry, if
    /// still `Init` (a racing caller may have already moved it on).
    pub(crate) async fn current_resolved(&self) -> Option<Arc<ResolveSignal>> {
        let guard = self.state.lock().await;
        match &*guard {
            RemoteState::Init { resolved, .. } => Some(resolved.clone()),
            _ => None,
        }
    }

    /// Unconditionally tears this remote down regardless of outstanding
    /// `outgoing`/`incoming` counts, used when the owning local endpoint
    /// itself is closing (spec.md §9 `close_endpoint`).
    pub(crate) async fn force_close(&self) {
        let mut guard = self.state.lock().await;
        if let RemoteState::Valid(v) = &mut *guard {
            let frame = encode_close_socket();
            let _ = codec::send_many(&mut v.writer, &[&frame]).await;
        }
        self.unlink_from_local();
        *guard = RemoteState::Closed;
    }
}

pub(crate) enum ConnectOutcome {
    Valid,
    Invalid(ConnectErrorCode),
    StillPending,
    Closed,
}

async fn send_control_response_via(
    writer: &mut OwnedWriteHalf,
    req_id: ControlRequestId,
    response: &[u8],
) -> Result<(), SendErrorCode> {
    let header = (ControlHeader::ControlResponse as i32).to_be_bytes();
    let req_id_bytes = (req_id as i32).to_be_bytes();
    let len_bytes = (response.len() as i32).to_be_bytes();
    codec::send_many(writer, &[&header, &req_id_bytes, &len_bytes, response])
        .await
        .map_err(|_| SendErrorCode::SendFailed)
}

pub(crate) enum InboundFound {
    Init,
    AlreadyValid,
    Busy,
    Invalid(ConnectErrorCode),
    RetryAsAbsent,
}
