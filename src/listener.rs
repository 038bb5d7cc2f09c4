//! The accept loop: reads the fixed handshake off each newly-accepted
//! socket, routes it to the addressed [`LocalEndPoint`], and hands the rest
//! of the cross-tiebreak logic to [`LocalShared::handle_inbound_connection`].

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::address::EndPointAddress;
use crate::codec;
use crate::control::ConnectionRequestResponse;
use crate::event::{ErrorEventKind, Event};
use crate::transport::TransportShared;

pub(crate) async fn accept_loop(shared: Arc<TransportShared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, _peer_addr)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    handle_inbound(shared, socket).await;
                });
            }
            Err(e) => {
                log::error!(
                    "accept loop for {}:{} failed, transport is down: {e}",
                    shared.bind_host,
                    shared.bind_port
                );
                for local in shared.endpoints_snapshot() {
                    local.post_event(Event::ErrorEvent(ErrorEventKind::TransportFailed {
                        reason: e.to_string(),
                    }));
                }
                return;
            }
        }
    }
}

async fn handle_inbound(shared: Arc<TransportShared>, mut socket: TcpStream) {
    let ep_id = match codec::recv_int32(&mut socket).await {
        Ok(v) => v,
        Err(_) => return,
    };
    let addr_bytes = match codec::recv_with_length(&mut socket).await {
        Ok(v) => v,
        Err(_) => return,
    };
    let peer = match EndPointAddress::try_decode(&addr_bytes) {
        Ok(a) => a,
        Err(_) => {
            let _ = codec::send_int32(&mut socket, ConnectionRequestResponse::Invalid as i32).await;
            return;
        }
    };

    if shared.is_closed() {
        let _ = codec::send_int32(&mut socket, ConnectionRequestResponse::Invalid as i32).await;
        return;
    }
    let local = match shared.lookup_endpoint(ep_id) {
        Some(local) => local,
        None => {
            let _ = codec::send_int32(&mut socket, ConnectionRequestResponse::Invalid as i32).await;
            return;
        }
    };

    local.handle_inbound_connection(peer, socket).await;
}
