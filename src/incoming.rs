//! The per-peer incoming-message loop (spec.md §4.6): one task per physical
//! connection, reading control and data frames until the socket closes.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::tcp::OwnedReadHalf;

use crate::codec;
use crate::control::{ControlHeader, FIRST_NON_RESERVED_CONNECTION_ID};
use crate::error::FramingError;
use crate::event::{ErrorEventKind, Event, Reliability};
use crate::local::LocalShared;
use crate::remote::{CloseSocketOutcome, FailOutcome, RemoteEndPoint};

pub(crate) async fn run(local: Arc<LocalShared>, remote: Arc<RemoteEndPoint>, mut reader: OwnedReadHalf) {
    loop {
        let header = match codec::recv_int32(&mut reader).await {
            Ok(h) => h,
            Err(_) => {
                fail(&local, &remote).await;
                return;
            }
        };

        if (header as u32) < FIRST_NON_RESERVED_CONNECTION_ID {
            match ControlHeader::from_i32(header) {
                Some(ControlHeader::RequestConnectionId) => {
                    if !handle_request_connection_id(&local, &remote, &mut reader).await {
                        fail(&local, &remote).await;
                        return;
                    }
                }
                Some(ControlHeader::CloseConnection) => {
                    if !handle_close_connection(&local, &remote, &mut reader).await {
                        fail(&local, &remote).await;
                        return;
                    }
                }
                Some(ControlHeader::ControlResponse) => {
                    if !handle_control_response(&local, &mut reader).await {
                        fail(&local, &remote).await;
                        return;
                    }
                }
                Some(ControlHeader::CloseSocket) => {
                    if !handle_close_socket(&local, &remote).await {
                        return;
                    }
                }
                None => {
                    let err = FramingError::UnknownControlHeader(header);
                    log::error!("{err} from {}", remote.peer);
                    fail(&local, &remote).await;
                    return;
                }
            }
        } else {
            let conn_id = header as u32;
            let payload = match codec::recv_with_length(&mut reader).await {
                Ok(p) => p,
                Err(_) => {
                    fail(&local, &remote).await;
                    return;
                }
            };
            local.post_event(Event::Received(conn_id, vec![payload]));
        }
    }
}

async fn handle_request_connection_id(
    local: &Arc<LocalShared>,
    remote: &Arc<RemoteEndPoint>,
    reader: &mut OwnedReadHalf,
) -> bool {
    let req_id = match codec::recv_int32(reader).await {
        Ok(v) => v as u32,
        Err(_) => return false,
    };
    let conn_id = local.allocate_connection_id();
    match remote.accept_incoming_connection(req_id, conn_id).await {
        Ok(()) => {
            local.post_event(Event::ConnectionOpened(
                conn_id,
                Reliability::ReliableOrdered,
                remote.peer.clone(),
            ));
            true
        }
        Err(e) => {
            log::warn!("failed to accept incoming connection from {}: {e}", remote.peer);
            false
        }
    }
}

async fn handle_close_connection(
    local: &Arc<LocalShared>,
    remote: &Arc<RemoteEndPoint>,
    reader: &mut OwnedReadHalf,
) -> bool {
    let conn_id = match codec::recv_int32(reader).await {
        Ok(v) => v as u32,
        Err(_) => return false,
    };
    let present = remote.remove_incoming(conn_id).await;
    if present {
        local.post_event(Event::ConnectionClosed(conn_id));
    } else {
        log::error!("CloseConnection for unknown connection {conn_id} from {}", remote.peer);
    }
    true
}

async fn handle_control_response(local: &Arc<LocalShared>, reader: &mut OwnedReadHalf) -> bool {
    let req_id = match codec::recv_int32(reader).await {
        Ok(v) => v as u32,
        Err(_) => return false,
    };
    let payload: Bytes = match codec::recv_with_length(reader).await {
        Ok(p) => p,
        Err(_) => return false,
    };
    local.resolve_pending_control(req_id, payload);
    true
}

/// Returns `false` if the reader loop should exit without consulting further
/// state (the caller already returned on our behalf).
async fn handle_close_socket(local: &Arc<LocalShared>, remote: &Arc<RemoteEndPoint>) -> bool {
    match remote.handle_close_socket().await {
        CloseSocketOutcome::WeAgree(drained) => {
            for id in drained {
                local.post_event(Event::ConnectionClosed(id));
            }
            false
        }
        CloseSocketOutcome::WeStayOpen(drained) => {
            for id in drained {
                local.post_event(Event::ConnectionClosed(id));
            }
            true
        }
        CloseSocketOutcome::PeerAcked => false,
        CloseSocketOutcome::Violation => {
            log::error!("CloseSocket received from {} in an unexpected state", remote.peer);
            false
        }
    }
}

async fn fail(local: &Arc<LocalShared>, remote: &Arc<RemoteEndPoint>) {
    match remote.fail().await {
        FailOutcome::WasValid(incoming) => {
            local.post_event(Event::ErrorEvent(ErrorEventKind::ConnectionLost {
                peer: remote.peer.clone(),
                incoming,
            }));
        }
        FailOutcome::WasClosing | FailOutcome::Unchanged => {}
    }
}
