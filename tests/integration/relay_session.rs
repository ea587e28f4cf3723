// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::cast_possible_truncation,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for relay sessions driven through the session manager.
//!
//! Exercises the public library API without a control server: each test
//! holds the receiving end of a control channel and plays the client,
//! while real TCP sockets play the remote peers.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tcpturn_proto::message::MAX_DATA_CHUNK;
use tcpturn_proto::{ConnectionStatus, TurnMessage};
use tcpturn_server::control::{ControlChannel, ControlReceiver, Outbound};
use tcpturn_server::manager::SessionManager;
use tcpturn_server::session::SessionState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn loopback() -> Option<IpAddr> {
    Some(IpAddr::from([127, 0, 0, 1]))
}

fn client() -> (ControlChannel, ControlReceiver) {
    ControlChannel::new("127.0.0.1:40000".parse().unwrap())
}

async fn next_message(rx: &mut ControlReceiver) -> TurnMessage {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("control message timed out")
    {
        Some(Outbound::Message(msg)) => msg,
        other => panic!("expected a framed message, got {other:?}"),
    }
}

async fn expect_status(
    rx: &mut ControlReceiver,
    peer: SocketAddr,
    expected: ConnectionStatus,
) {
    match next_message(rx).await {
        TurnMessage::ConnectionStatusIndication { peer: p, status, .. } => {
            assert_eq!(p, peer);
            assert_eq!(status, expected);
        }
        other => panic!("expected {expected} for {peer}, got {other:?}"),
    }
}

async fn wait_for(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn inbound_peer_round_trip() {
    let manager = SessionManager::new(loopback());
    let (control, mut rx) = client();
    let session = manager.allocate_binding(&control);
    let relay = session.relay_addr().unwrap();
    assert_eq!(relay.ip(), IpAddr::from([127, 0, 0, 1]));

    // Peer P connects to the relay address.
    let mut peer = TcpStream::connect(relay).await.unwrap();
    let p = peer.local_addr().unwrap();
    expect_status(&mut rx, p, ConnectionStatus::Established).await;
    assert!(session.is_permitted(p.ip()));

    // P sends 5 bytes; the client gets one data indication.
    peer.write_all(b"hello").await.unwrap();
    match next_message(&mut rx).await {
        TurnMessage::DataIndication { peer: from, data, .. } => {
            assert_eq!(from, p);
            assert_eq!(data, b"hello");
        }
        other => panic!("expected DataIndication, got {other:?}"),
    }

    // The client answers; the existing connection is reused.
    assert!(session.write(p, b"hi".to_vec()));
    let mut buf = [0u8; 2];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");

    // P hangs up.
    drop(peer);
    expect_status(&mut rx, p, ConnectionStatus::Closed).await;
    assert_eq!(session.connection_count(), 0);
}

#[tokio::test]
async fn outbound_write_opens_connection_to_listening_peer() {
    let manager = SessionManager::new(loopback());
    let (control, mut rx) = client();
    let session = manager.allocate_binding(&control);

    let q_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let q = q_listener.local_addr().unwrap();

    assert!(!session.write(q, b"ping".to_vec()));
    let (mut q_stream, _) = q_listener.accept().await.unwrap();
    let mut buf = [0u8; 4];
    q_stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    expect_status(&mut rx, q, ConnectionStatus::Established).await;
    assert!(session.is_connected(q));
    assert!(session.is_permitted(q.ip()));

    // Replies from Q flow back as data indications.
    q_stream.write_all(b"pong").await.unwrap();
    match next_message(&mut rx).await {
        TurnMessage::DataIndication { peer, data, .. } => {
            assert_eq!(peer, q);
            assert_eq!(data, b"pong");
        }
        other => panic!("expected DataIndication, got {other:?}"),
    }

    // A second write reuses the connection.
    assert!(session.write(q, b"again".to_vec()));
    let mut buf = [0u8; 5];
    q_stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"again");
}

#[tokio::test]
async fn large_inbound_payload_is_split() {
    let manager = SessionManager::new(loopback());
    let (control, mut rx) = client();
    let session = manager.allocate_binding(&control);

    let mut peer = TcpStream::connect(session.relay_addr().unwrap()).await.unwrap();
    let p = peer.local_addr().unwrap();
    expect_status(&mut rx, p, ConnectionStatus::Established).await;

    let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
    peer.write_all(&payload).await.unwrap();

    let mut received = Vec::new();
    while received.len() < payload.len() {
        match next_message(&mut rx).await {
            TurnMessage::DataIndication { data, .. } => {
                assert!(!data.is_empty());
                assert!(data.len() <= MAX_DATA_CHUNK);
                received.extend_from_slice(&data);
            }
            other => panic!("expected DataIndication, got {other:?}"),
        }
    }
    assert_eq!(received, payload);
}

#[tokio::test]
async fn connect_requests_keep_permissions_bounded() {
    let manager = SessionManager::new(loopback());
    let (control, mut rx) = client();
    let session = manager.allocate_binding(&control);

    for i in 0..150u8 {
        let peer = SocketAddr::from(([203, 0, 113, i], 5000));
        session.handle_connect(peer);
        expect_status(&mut rx, peer, ConnectionStatus::Listen).await;
    }
    assert_eq!(session.permission_count(), 100);
    assert!(!session.is_permitted(IpAddr::from([203, 0, 113, 0])));
    assert!(session.is_permitted(IpAddr::from([203, 0, 113, 149])));
}

#[tokio::test]
async fn remove_binding_closes_peers_and_listener() {
    let manager = SessionManager::new(loopback());
    let (control, mut rx) = client();
    let session = manager.allocate_binding(&control);
    let relay = session.relay_addr().unwrap();

    let mut peer = TcpStream::connect(relay).await.unwrap();
    let p = peer.local_addr().unwrap();
    expect_status(&mut rx, p, ConnectionStatus::Established).await;

    manager.remove_binding(control.id());
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.connection_count(), 0);
    assert_eq!(session.permission_count(), 0);
    assert_eq!(manager.session_count(), 0);

    // The peer sees EOF and the relay address no longer accepts.
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf))
        .await
        .expect("peer read timed out")
        .unwrap_or(0);
    assert_eq!(n, 0);
    wait_for(|| std::net::TcpStream::connect(relay).is_err()).await;

    // Nothing further reaches the client.
    assert!(!session.write(p, b"late".to_vec()));
}

#[tokio::test]
async fn sessions_are_isolated() {
    let manager = SessionManager::new(loopback());
    let (a, mut rx_a) = client();
    let (b, mut rx_b) = client();
    let session_a = manager.allocate_binding(&a);
    let session_b = manager.allocate_binding(&b);

    let peer = TcpStream::connect(session_a.relay_addr().unwrap()).await.unwrap();
    let p = peer.local_addr().unwrap();
    expect_status(&mut rx_a, p, ConnectionStatus::Established).await;

    assert!(session_a.is_connected(p));
    assert!(!session_b.is_connected(p));
    assert!(rx_b.try_recv().is_err());
    assert_eq!(manager.connection_count(), 1);
}

#[tokio::test]
async fn unread_control_channel_stalls_peer_writes() {
    const BUDGET: usize = 128 * 1024;
    const TOTAL: usize = 32 * 1024 * 1024;

    let manager = SessionManager::new(loopback());
    let (control, mut rx) = ControlChannel::with_budget("127.0.0.1:40000".parse().unwrap(), BUDGET);
    let session = manager.allocate_binding(&control);

    let mut peer = TcpStream::connect(session.relay_addr().unwrap()).await.unwrap();
    let p = peer.local_addr().unwrap();
    expect_status(&mut rx, p, ConnectionStatus::Established).await;

    let writer = tokio::spawn(async move {
        peer.write_all(&vec![0x5a; TOTAL]).await.unwrap();
        peer
    });

    // The client reads nothing for a while.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!writer.is_finished(), "peer wrote everything into an unread session");
    assert!(control.queued_data() <= BUDGET);

    let mut received = 0;
    while received < TOTAL {
        match next_message(&mut rx).await {
            TurnMessage::DataIndication { peer: from, data, .. } => {
                assert_eq!(from, p);
                assert!(data.iter().all(|&b| b == 0x5a));
                received += data.len();
            }
            other => panic!("expected DataIndication, got {other:?}"),
        }
    }
    assert_eq!(received, TOTAL);
    tokio::time::timeout(Duration::from_secs(5), writer)
        .await
        .expect("peer writes still stalled after draining")
        .unwrap();
}
