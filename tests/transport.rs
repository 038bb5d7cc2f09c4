//! Integration coverage for the six concrete end-to-end scenarios in
//! spec.md §8, against real loopback sockets bound to `127.0.0.1:0`.

use std::time::Duration;

use bytes::Bytes;
use mux_transport::{EndPointAddress, ErrorEventKind, Event, Reliability, Transport, TransportConfig};

async fn bind_loopback() -> Transport {
    Transport::bind("127.0.0.1", 0, TransportConfig::default())
        .await
        .expect("bind on an ephemeral loopback port must succeed")
}

fn text(chunks: Vec<Bytes>) -> String {
    let bytes: Vec<u8> = chunks.into_iter().flatten().collect();
    String::from_utf8(bytes).unwrap()
}

/// Scenario 1: loopback ping.
#[tokio::test]
async fn loopback_ping_delivers_opened_then_received() {
    let transport = bind_loopback().await;
    let e1 = transport.new_endpoint().unwrap();
    let e2 = transport.new_endpoint().unwrap();

    let conn = e1
        .connect(e2.address().clone(), Reliability::ReliableOrdered)
        .await
        .expect("connect to a live peer endpoint must succeed");
    conn.send(vec![Bytes::from_static(b"ping")]).await.unwrap();

    let opened = e2.receive().await.unwrap();
    let received_id = match opened {
        Event::ConnectionOpened(id, reliability, peer) => {
            assert_eq!(reliability, Reliability::ReliableOrdered);
            assert_eq!(&peer, e1.address());
            id
        }
        other => panic!("expected ConnectionOpened, got {other:?}"),
    };

    match e2.receive().await.unwrap() {
        Event::Received(id, chunks) => {
            assert_eq!(id, received_id);
            assert_eq!(text(chunks), "ping");
        }
        other => panic!("expected Received, got {other:?}"),
    }
}

/// Scenario 2: self-connect bypasses the network path entirely.
#[tokio::test]
async fn self_connect_loops_through_the_local_mailbox() {
    let transport = bind_loopback().await;
    let e = transport.new_endpoint().unwrap();

    let conn = e
        .connect(e.address().clone(), Reliability::ReliableOrdered)
        .await
        .unwrap();
    conn.send(vec![Bytes::from_static(b"x")]).await.unwrap();

    let id = match e.receive().await.unwrap() {
        Event::ConnectionOpened(id, reliability, peer) => {
            assert_eq!(reliability, Reliability::ReliableOrdered);
            assert_eq!(&peer, e.address());
            id
        }
        other => panic!("expected ConnectionOpened, got {other:?}"),
    };
    assert_eq!(conn.connection_id(), id);

    match e.receive().await.unwrap() {
        Event::Received(got_id, chunks) => {
            assert_eq!(got_id, id);
            assert_eq!(text(chunks), "x");
        }
        other => panic!("expected Received, got {other:?}"),
    }

    conn.close().await;
    match e.receive().await.unwrap() {
        Event::ConnectionClosed(got_id) => assert_eq!(got_id, id),
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }

    let err = conn.send(vec![Bytes::from_static(b"too late")]).await;
    assert!(matches!(err, Err(mux_transport::SendErrorCode::SendClosed)));
}

/// Scenario 3: a second connect after a close, before any timeout, reuses
/// the same physical socket and gets a fresh connection id.
#[tokio::test]
async fn reconnecting_before_timeout_reuses_the_physical_socket() {
    let transport = bind_loopback().await;
    let e1 = transport.new_endpoint().unwrap();
    let e2 = transport.new_endpoint().unwrap();

    let conn1 = e1
        .connect(e2.address().clone(), Reliability::ReliableOrdered)
        .await
        .unwrap();
    let c1 = conn1.connection_id();
    conn1.close().await;

    // drain e2's side of the first connection's lifecycle before opening c2.
    assert!(matches!(e2.receive().await.unwrap(), Event::ConnectionOpened(..)));
    assert!(matches!(e2.receive().await.unwrap(), Event::ConnectionClosed(id) if id == c1));

    let conn2 = e1
        .connect(e2.address().clone(), Reliability::ReliableOrdered)
        .await
        .expect("a second connect before any timeout must reuse the torn-down socket");
    let c2 = conn2.connection_id();
    assert_ne!(c1, c2, "connection ids are never reused within an endpoint's lifetime");

    conn2.send(vec![Bytes::from_static(b"again")]).await.unwrap();
    assert!(matches!(e2.receive().await.unwrap(), Event::ConnectionOpened(id, ..) if id == c2));
    match e2.receive().await.unwrap() {
        Event::Received(id, chunks) => {
            assert_eq!(id, c2);
            assert_eq!(text(chunks), "again");
        }
        other => panic!("expected Received, got {other:?}"),
    }
}

/// Scenario 4: simultaneous mutual connect resolves via the lexicographic
/// tiebreak without either side hanging.
#[tokio::test]
async fn simultaneous_connect_resolves_via_crossed_tiebreak() {
    let transport = bind_loopback().await;
    let e1 = transport.new_endpoint().unwrap();
    let e2 = transport.new_endpoint().unwrap();

    let (r1, r2) = tokio::join!(
        e1.connect(e2.address().clone(), Reliability::ReliableOrdered),
        e2.connect(e1.address().clone(), Reliability::ReliableOrdered),
    );
    let conn1 = r1.expect("e1's concurrent connect must still succeed");
    let conn2 = r2.expect("e2's concurrent connect must still succeed");

    conn1.send(vec![Bytes::from_static(b"from-e1")]).await.unwrap();
    conn2.send(vec![Bytes::from_static(b"from-e2")]).await.unwrap();

    let mut saw_from_e1 = false;
    let mut saw_from_e2 = false;
    for _ in 0..4 {
        tokio::select! {
            ev = e1.receive() => {
                if let Event::Received(_, chunks) = ev.unwrap() {
                    assert_eq!(text(chunks), "from-e2");
                    saw_from_e2 = true;
                }
            }
            ev = e2.receive() => {
                if let Event::Received(_, chunks) = ev.unwrap() {
                    assert_eq!(text(chunks), "from-e1");
                    saw_from_e1 = true;
                }
            }
        }
        if saw_from_e1 && saw_from_e2 {
            break;
        }
    }
    assert!(saw_from_e1 && saw_from_e2, "both directions must be deliverable over the one surviving socket");
}

/// Scenario 5: an abrupt peer crash (socket dropped without the close
/// protocol) surfaces exactly one `ConnectionLost` naming the connections
/// that peer had open against us, and the remote then behaves as gone.
#[tokio::test]
async fn peer_crash_surfaces_a_single_connection_lost_event() {
    let transport = bind_loopback().await;
    let acceptor = transport.new_endpoint().unwrap();
    let acceptor_addr = acceptor.address().clone();

    let (addr_tx, addr_rx) = tokio::sync::oneshot::channel::<EndPointAddress>();
    let (crash_tx, crash_rx) = tokio::sync::oneshot::channel::<()>();

    let crash_thread = std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let crashing_transport = Transport::bind("127.0.0.1", 0, TransportConfig::default())
                .await
                .unwrap();
            let crashing_endpoint = crashing_transport.new_endpoint().unwrap();
            let _ = addr_tx.send(crashing_endpoint.address().clone());
            let conn = crashing_endpoint
                .connect(acceptor_addr, Reliability::ReliableOrdered)
                .await
                .unwrap();
            conn.send(vec![Bytes::from_static(b"hello")]).await.unwrap();
            let _ = crash_rx.await;
            // returning here drops `rt` below, cancelling every task spawned on
            // it (including the incoming-message loop) and closing its socket
            // without ever running the graceful close protocol.
        });
    });

    let peer_addr = addr_rx.await.unwrap();
    let c1 = match acceptor.receive().await.unwrap() {
        Event::ConnectionOpened(id, _, peer) => {
            assert_eq!(peer, peer_addr);
            id
        }
        other => panic!("expected ConnectionOpened, got {other:?}"),
    };
    match acceptor.receive().await.unwrap() {
        Event::Received(id, _) => assert_eq!(id, c1),
        other => panic!("expected Received, got {other:?}"),
    }

    let _ = crash_tx.send(());
    tokio::task::spawn_blocking(move || crash_thread.join().unwrap())
        .await
        .unwrap();

    match acceptor.receive().await.unwrap() {
        Event::ErrorEvent(ErrorEventKind::ConnectionLost { peer, incoming }) => {
            assert_eq!(peer, peer_addr);
            assert_eq!(incoming, vec![c1]);
        }
        other => panic!("expected ErrorEvent(ConnectionLost), got {other:?}"),
    }

    let reconnect = acceptor
        .connect(peer_addr, Reliability::ReliableOrdered)
        .await;
    assert!(
        matches!(
            reconnect,
            Err(mux_transport::ConnectErrorCode::ConnectNotFound)
                | Err(mux_transport::ConnectErrorCode::ConnectFailed)
        ),
        "connecting to a dead peer must fail, not hang: got {reconnect:?}"
    );
}

/// Scenario 6: a close racing a peer's `RequestConnectionId` demotes the
/// close instead of tearing down the shared socket.
#[tokio::test]
async fn close_racing_a_new_request_keeps_the_socket_open() {
    let transport = bind_loopback().await;
    let e1 = transport.new_endpoint().unwrap();
    let e2 = transport.new_endpoint().unwrap();

    let conn1 = e1
        .connect(e2.address().clone(), Reliability::ReliableOrdered)
        .await
        .unwrap();
    let c1 = conn1.connection_id();
    assert!(matches!(e2.receive().await.unwrap(), Event::ConnectionOpened(id, ..) if id == c1));

    let (_, conn2_result) = tokio::join!(conn1.close(), e2.connect(e1.address().clone(), Reliability::ReliableOrdered));
    let conn2 = conn2_result.expect("a request racing the close must still be granted a new id");
    let c2 = conn2.connection_id();
    assert_ne!(c1, c2);

    // e1's side must observe the new incoming connection rather than tearing
    // the remote down; give the race a moment to settle either order.
    let mut saw_opened = false;
    let mut saw_closed = false;
    for _ in 0..3 {
        match tokio::time::timeout(Duration::from_millis(500), e1.receive()).await {
            Ok(Ok(Event::ConnectionOpened(id, ..))) if id == c2 => saw_opened = true,
            Ok(Ok(Event::ConnectionClosed(id))) if id == c1 => saw_closed = true,
            Ok(Ok(other)) => panic!("unexpected event during close race: {other:?}"),
            Ok(Err(e)) => panic!("endpoint closed unexpectedly: {e}"),
            Err(_) => break,
        }
        if saw_opened && saw_closed {
            break;
        }
    }
    assert!(saw_opened, "peer's racing request must still open a connection");

    conn2.send(vec![Bytes::from_static(b"still alive")]).await.unwrap();
    match e1.receive().await.unwrap() {
        Event::Received(id, chunks) => {
            assert_eq!(id, c2);
            assert_eq!(text(chunks), "still alive");
        }
        other => panic!("expected Received, got {other:?}"),
    }
}
