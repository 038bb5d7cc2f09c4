//! The local endpoint (spec.md §3, §4.2-§4.5, §4.9): one TCP-reachable
//! identity, its `remotes` map, its event mailbox, and `connect()`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::time::Duration;

use crate::address::EndPointAddress;
use crate::codec;
use crate::connection::Connection;
use crate::control::{ConnectionId, ConnectionRequestResponse, ControlHeader, ControlRequestId, FIRST_NON_RESERVED_CONNECTION_ID};
use crate::error::{ConnectErrorCode, EndPointClosedError, SendErrorCode};
use crate::event::{Event, Reliability};
use crate::incoming;
use crate::remote::{ConnectOutcome, FoundOutcome, Origin, RemoteEndPoint};
use crate::signal::ResolveSignal;
use crate::transport::TransportShared;

/// Shared, `Arc`-held state for one local endpoint. [`LocalEndPoint`] is the
/// thin public handle around it.
pub(crate) struct LocalShared {
    self_weak: Weak<LocalShared>,
    address: EndPointAddress,
    transport: Weak<TransportShared>,
    resolve_timeout: Duration,
    remotes: StdMutex<HashMap<EndPointAddress, Arc<RemoteEndPoint>>>,
    next_connection_id: AtomicU32,
    next_control_request_id: AtomicU32,
    pending_control: StdMutex<HashMap<ControlRequestId, oneshot::Sender<Bytes>>>,
    mailbox_tx: mpsc::UnboundedSender<Event>,
    mailbox_rx: TokioMutex<mpsc::UnboundedReceiver<Event>>,
    shutting_down: AtomicBool,
    receive_closed: AtomicBool,
}

impl LocalShared {
    pub(crate) fn new(
        address: EndPointAddress,
        transport: Weak<TransportShared>,
        resolve_timeout: Duration,
    ) -> Arc<Self> {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|self_weak| LocalShared {
            self_weak: self_weak.clone(),
            address,
            transport,
            resolve_timeout,
            remotes: StdMutex::new(HashMap::new()),
            next_connection_id: AtomicU32::new(FIRST_NON_RESERVED_CONNECTION_ID),
            next_control_request_id: AtomicU32::new(0),
            pending_control: StdMutex::new(HashMap::new()),
            mailbox_tx,
            mailbox_rx: TokioMutex::new(mailbox_rx),
            shutting_down: AtomicBool::new(false),
            receive_closed: AtomicBool::new(false),
        })
    }

    /// Recovers an owned handle to this shared state, needed wherever a
    /// `'static` task or a `Weak` back-reference must be constructed from
    /// inside a `&self` method.
    fn arc(&self) -> Arc<LocalShared> {
        self.self_weak
            .upgrade()
            .expect("LocalShared outlives its own weak self-reference")
    }

    pub(crate) fn address(&self) -> &EndPointAddress {
        &self.address
    }

    pub(crate) fn post_event(&self, event: Event) {
        let _ = self.mailbox_tx.send(event);
    }

    pub(crate) fn allocate_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Removes `peer` from the map, but only if the current occupant is
    /// still the remote identified by `local_id` (guards against a fresh
    /// replacement having already taken its place).
    pub(crate) fn remove_remote_if_current(&self, peer: &EndPointAddress, local_id: u64) {
        let mut map = self.remotes.lock().unwrap();
        if let Some(existing) = map.get(peer) {
            if existing.local_id == local_id {
                map.remove(peer);
            }
        }
    }

    fn register_pending_control(&self) -> (ControlRequestId, oneshot::Receiver<Bytes>) {
        let req_id = self.next_control_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_control.lock().unwrap().insert(req_id, tx);
        (req_id, rx)
    }

    pub(crate) fn resolve_pending_control(&self, req_id: ControlRequestId, payload: Bytes) {
        let sender = self.pending_control.lock().unwrap().remove(&req_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(payload);
            }
            None => log::warn!("control response for unknown request id {req_id}"),
        }
    }

    fn spawn_incoming_loop(&self, remote: Arc<RemoteEndPoint>, reader: OwnedReadHalf) {
        let local = self.arc();
        tokio::spawn(async move {
            incoming::run(local, remote, reader).await;
        });
    }

    /// spec.md §4.5: find-or-create-remote for the outbound `connect()` path.
    /// Loops internally on `Init`/`Closing` (waits for the resolved signal)
    /// and on a `Closed` entry racing its own removal.
    async fn find_or_create_remote(
        &self,
        peer: EndPointAddress,
    ) -> Result<(Arc<RemoteEndPoint>, bool, Option<Arc<ResolveSignal>>), ConnectErrorCode> {
        loop {
            let existing = {
                let map = self.remotes.lock().unwrap();
                map.get(&peer).cloned()
            };
            if let Some(remote) = existing {
                match remote.on_found(Origin::Local).await {
                    FoundOutcome::BumpedValid => return Ok((remote, false, None)),
                    FoundOutcome::WaitThenRetry(resolved) => {
                        if !resolved.wait_bounded(self.resolve_timeout).await {
                            return Err(ConnectErrorCode::ConnectTimeout);
                        }
                        continue;
                    }
                    FoundOutcome::RetryAsAbsent => continue,
                    FoundOutcome::Invalid(err) => return Err(err),
                    FoundOutcome::AlreadyConnected => return Err(ConnectErrorCode::ConnectFailed),
                }
            }
            let (remote, resolved) =
                RemoteEndPoint::new_init(peer.clone(), Origin::Local, self.self_weak.clone());
            let mut map = self.remotes.lock().unwrap();
            match map.entry(peer.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(remote.clone());
                }
            }
            drop(map);
            return Ok((remote, true, Some(resolved)));
        }
    }

    /// Connects to `peer` over a fresh or reused physical socket, per
    /// spec.md §4.3–§4.5, then requests a fresh connection id from it.
    async fn dial(
        &self,
        remote: &Arc<RemoteEndPoint>,
        peer: &EndPointAddress,
        resolved: &ResolveSignal,
    ) -> Result<bool, ConnectErrorCode> {
        let port: u16 = peer
            .service()
            .parse()
            .map_err(|_| ConnectErrorCode::ConnectNotFound)?;
        let mut stream = match TcpStream::connect((peer.host(), port)).await {
            Ok(s) => s,
            Err(_) => {
                remote
                    .publish_invalid(ConnectErrorCode::ConnectNotFound, resolved)
                    .await;
                return Err(ConnectErrorCode::ConnectNotFound);
            }
        };

        let handshake: Result<i32, std::io::Error> = async {
            codec::send_int32(&mut stream, self.address.endpoint_id())
                .await
                .map_err(std::io::Error::from)?;
            let addr_bytes = self.address.encode();
            codec::send_with_length(&mut stream, &addr_bytes)
                .await
                .map_err(std::io::Error::from)?;
            codec::recv_int32(&mut stream)
                .await
                .map_err(std::io::Error::from)
        }
        .await;

        let response = match handshake {
            Ok(v) => v,
            Err(_) => {
                remote
                    .publish_invalid(ConnectErrorCode::ConnectFailed, resolved)
                    .await;
                return Err(ConnectErrorCode::ConnectFailed);
            }
        };

        match ConnectionRequestResponse::from_i32(response) {
            Some(ConnectionRequestResponse::Accepted) => {
                let (reader, writer) = stream.into_split();
                remote.publish_valid(writer, 0, resolved).await;
                self.spawn_incoming_loop(remote.clone(), reader);
                Ok(true)
            }
            Some(ConnectionRequestResponse::Invalid) => {
                remote
                    .publish_invalid(ConnectErrorCode::ConnectNotFound, resolved)
                    .await;
                Err(ConnectErrorCode::ConnectNotFound)
            }
            Some(ConnectionRequestResponse::Crossed) => {
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
                Ok(false)
            }
            None => {
                remote
                    .publish_invalid(ConnectErrorCode::ConnectFailed, resolved)
                    .await;
                Err(ConnectErrorCode::ConnectFailed)
            }
        }
    }

    async fn request_connection_id(
        &self,
        remote: &Arc<RemoteEndPoint>,
    ) -> Result<ConnectionId, ConnectErrorCode> {
        let (req_id, rx) = self.register_pending_control();
        remote
            .send_control_request(ControlHeader::RequestConnectionId, req_id)
            .await
            .map_err(|_| ConnectErrorCode::ConnectFailed)?;
        let payload = rx.await.map_err(|_| ConnectErrorCode::ConnectFailed)?;
        if payload.len() != 4 {
            return Err(ConnectErrorCode::ConnectFailed);
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&payload[..4]);
        Ok(u32::from_be_bytes(buf))
    }

    async fn connect_inner(
        &self,
        peer: EndPointAddress,
        reliability: Reliability,
    ) -> Result<Connection, ConnectErrorCode> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ConnectErrorCode::ConnectFailed);
        }
        if peer == self.address {
            let conn_id = self.allocate_connection_id();
            self.post_event(Event::ConnectionOpened(conn_id, reliability, self.address.clone()));
            return Ok(Connection::self_loop(self.arc(), conn_id));
        }

        let (remote, is_new, resolved_new) = self.find_or_create_remote(peer.clone()).await?;
        if is_new {
            let resolved = resolved_new.expect("freshly created remote carries its resolved signal");
            let proceeded = self.dial(&remote, &peer, &resolved).await?;
            if !proceeded {
                if !resolved.wait_bounded(self.resolve_timeout).await {
                    return Err(ConnectErrorCode::ConnectTimeout);
                }
                match remote.snapshot_outcome().await {
                    ConnectOutcome::Valid => {}
                    ConnectOutcome::Invalid(err) => return Err(err),
                    ConnectOutcome::StillPending | ConnectOutcome::Closed => {
                        return Err(ConnectErrorCode::ConnectFailed)
                    }
                }
            }
            remote.bump_outgoing().await;
        }

        let conn_id = self.request_connection_id(&remote).await?;
        Ok(Connection::networked(self.arc(), remote, conn_id))
    }

    pub(crate) async fn send(
        &self,
        remote: &Arc<RemoteEndPoint>,
        conn_id: ConnectionId,
        chunks: &[Bytes],
    ) -> Result<(), SendErrorCode> {
        remote.send_data(conn_id, chunks).await
    }

    pub(crate) async fn close_connection(&self, remote: &Arc<RemoteEndPoint>, conn_id: ConnectionId) {
        if let Err(e) = remote.close_logical_connection(conn_id).await {
            log::debug!("close on {conn_id} to an already-gone remote: {e}");
        }
    }

    /// spec.md §4.4: accept a raw inbound socket that has already completed
    /// the handshake read (peer's endpoint id and address) and been routed
    /// to this local endpoint.
    pub(crate) async fn handle_inbound_connection(&self, peer: EndPointAddress, mut socket: TcpStream) {
        loop {
            let existing = {
                let map = self.remotes.lock().unwrap();
                map.get(&peer).cloned()
            };
            let (remote, is_new) = match existing {
                Some(remote) => match remote.peek_for_inbound().await {
                    crate::remote::InboundFound::Init => (remote, false),
                    crate::remote::InboundFound::AlreadyValid => {
                        log::warn!("duplicate inbound connection from {peer} while already valid");
                        reject(&mut socket).await;
                        return;
                    }
                    crate::remote::InboundFound::Busy | crate::remote::InboundFound::Invalid(_) => {
                        reject(&mut socket).await;
                        return;
                    }
                    crate::remote::InboundFound::RetryAsAbsent => continue,
                },
                None => {
                    let (remote, _resolved) =
                        RemoteEndPoint::new_init(peer.clone(), Origin::Remote, self.self_weak.clone());
                    let mut map = self.remotes.lock().unwrap();
                    match map.entry(peer.clone()) {
                        Entry::Occupied(_) => {
                            drop(map);
                            continue;
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(remote.clone());
                        }
                    }
                    (remote, true)
                }
            };

            if !is_new && self.address < peer {
                let _ = codec::send_int32(&mut socket, ConnectionRequestResponse::Crossed as i32).await;
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut socket).await;
                return;
            }

            if codec::send_int32(&mut socket, ConnectionRequestResponse::Accepted as i32)
                .await
                .is_err()
            {
                remote.force_invalid_if_init(ConnectErrorCode::ConnectFailed).await;
                return;
            }
            let resolved = match remote.current_resolved().await {
                Some(r) => r,
                None => return,
            };
            let (reader, writer) = socket.into_split();
            remote.publish_valid(writer, 0, &resolved).await;
            self.spawn_incoming_loop(remote.clone(), reader);
            return;
        }
    }

    /// spec.md §9 `close_endpoint`: force every remote closed, unregister
    /// from the transport, then deliver the terminal `EndPointClosed` event.
    pub(crate) async fn close(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let remotes: Vec<Arc<RemoteEndPoint>> = {
            let map = self.remotes.lock().unwrap();
            map.values().cloned().collect()
        };
        for remote in remotes {
            remote.force_close().await;
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.forget_endpoint(self.address.endpoint_id());
        }
        self.post_event(Event::EndPointClosed);
    }
}

async fn reject(socket: &mut TcpStream) {
    let _ = codec::send_int32(socket, ConnectionRequestResponse::Invalid as i32).await;
}

/// A TCP-reachable identity within a [`Transport`](crate::transport::Transport).
///
/// Cloning an `EndPointAddress` is cheap; cloning a `LocalEndPoint` shares
/// the same mailbox and `remotes` map (it is a thin `Arc` handle).
#[derive(Clone)]
pub struct LocalEndPoint {
    inner: Arc<LocalShared>,
}

impl LocalEndPoint {
    pub(crate) fn new(inner: Arc<LocalShared>) -> Self {
        LocalEndPoint { inner }
    }

    pub fn address(&self) -> &EndPointAddress {
        &self.inner.address
    }

    /// Opens a logical connection to `peer`, reusing the physical TCP
    /// connection to that peer if one already exists (spec.md §4.3). Any
    /// wait on another attempt's resolved signal, ours or a crossed peer's,
    /// is bounded by the transport's configured resolve timeout (spec.md
    /// §4.10, Open Question (a)).
    pub async fn connect(
        &self,
        peer: EndPointAddress,
        reliability: Reliability,
    ) -> Result<Connection, ConnectErrorCode> {
        self.inner.connect_inner(peer, reliability).await
    }

    /// Blocks until the next event is available, or returns immediately
    /// once this endpoint has closed (spec.md §9, Open Question (b)).
    pub async fn receive(&self) -> Result<Event, EndPointClosedError> {
        if self.inner.receive_closed.load(Ordering::Acquire) {
            return Err(EndPointClosedError);
        }
        let mut rx = self.inner.mailbox_rx.lock().await;
        match rx.recv().await {
            Some(Event::EndPointClosed) => {
                self.inner.receive_closed.store(true, Ordering::Release);
                Ok(Event::EndPointClosed)
            }
            Some(event) => Ok(event),
            None => {
                self.inner.receive_closed.store(true, Ordering::Release);
                Err(EndPointClosedError)
            }
        }
    }

    /// Closes this endpoint: every remote is torn down, a best-effort
    /// `CloseSocket` is sent to each, and `receive()` will never block again.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}
