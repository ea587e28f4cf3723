// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! End-to-end tests over a real control server.
//!
//! A client speaks framed postcard messages on the control connection,
//! remote peers use plain TCP against the relay address, and the tests
//! check what each side observes.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tcpturn_proto::codec;
use tcpturn_proto::{ConnectionStatus, TransactionId, TurnMessage};
use tcpturn_server::manager::SessionManager;
use tcpturn_server::server::{self, ServerOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Start the control server in-process with relays on loopback.
async fn start_server() -> (SocketAddr, Arc<SessionManager>) {
    let manager = Arc::new(SessionManager::new(Some(IpAddr::from([127, 0, 0, 1]))));
    let (addr, _handle) = server::start_server(
        "127.0.0.1:0",
        Arc::clone(&manager),
        ServerOptions::default(),
    )
    .await
    .expect("failed to start control server");
    (addr, manager)
}

async fn send(client: &mut TcpStream, msg: &TurnMessage) {
    codec::write_frame(client, msg).await.unwrap();
}

async fn recv(client: &mut TcpStream) -> TurnMessage {
    let frame = tokio::time::timeout(Duration::from_secs(5), codec::read_frame(client))
        .await
        .expect("recv timed out")
        .unwrap()
        .expect("control connection closed");
    codec::decode(&frame).unwrap()
}

async fn allocate(client: &mut TcpStream) -> SocketAddr {
    send(
        client,
        &TurnMessage::AllocateRequest {
            transaction_id: TransactionId::from_u128(1),
        },
    )
    .await;
    match recv(client).await {
        TurnMessage::AllocateSuccess { relay_address, .. } => relay_address,
        other => panic!("expected AllocateSuccess, got {other:?}"),
    }
}

async fn expect_status(client: &mut TcpStream, peer: SocketAddr, expected: ConnectionStatus) {
    match recv(client).await {
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
async fn allocate_then_relay_both_ways() {
    let (addr, _manager) = start_server().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    let relay = allocate(&mut client).await;

    // Peer P connects and sends five bytes.
    let mut peer = TcpStream::connect(relay).await.unwrap();
    let p = peer.local_addr().unwrap();
    expect_status(&mut client, p, ConnectionStatus::Established).await;

    peer.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
    match recv(&mut client).await {
        TurnMessage::DataIndication { peer: from, data, .. } => {
            assert_eq!(from, p);
            assert_eq!(data, vec![1, 2, 3, 4, 5]);
        }
        other => panic!("expected DataIndication, got {other:?}"),
    }

    // The client replies; P receives the raw bytes, unframed.
    send(
        &mut client,
        &TurnMessage::SendIndication {
            transaction_id: TransactionId::from_u128(2),
            peer: p,
            data: b"hi".to_vec(),
        },
    )
    .await;
    let mut buf = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(5), peer.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hi");

    drop(peer);
    expect_status(&mut client, p, ConnectionStatus::Closed).await;
}

#[tokio::test]
async fn send_to_unconnected_peer_dials_out() {
    let (addr, _manager) = start_server().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    allocate(&mut client).await;

    let q_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let q = q_listener.local_addr().unwrap();

    send(
        &mut client,
        &TurnMessage::SendIndication {
            transaction_id: TransactionId::from_u128(3),
            peer: q,
            data: b"first".to_vec(),
        },
    )
    .await;

    let (mut q_stream, _) = tokio::time::timeout(Duration::from_secs(5), q_listener.accept())
        .await
        .unwrap()
        .unwrap();
    let mut buf = [0u8; 5];
    q_stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"first");
    expect_status(&mut client, q, ConnectionStatus::Established).await;
}

#[tokio::test]
async fn connect_request_is_acknowledged_with_listen() {
    let (addr, _manager) = start_server().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    allocate(&mut client).await;

    let peer: SocketAddr = "198.51.100.20:7000".parse().unwrap();
    send(
        &mut client,
        &TurnMessage::ConnectRequest {
            transaction_id: TransactionId::from_u128(4),
            peer,
        },
    )
    .await;
    expect_status(&mut client, peer, ConnectionStatus::Listen).await;
}

#[tokio::test]
async fn repeated_allocate_keeps_relay_address() {
    let (addr, manager) = start_server().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    let first = allocate(&mut client).await;
    let second = allocate(&mut client).await;
    assert_eq!(first, second);
    assert_eq!(manager.session_count(), 1);
}

#[tokio::test]
async fn clients_get_distinct_relays() {
    let (addr, manager) = start_server().await;
    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();
    let relay_a = allocate(&mut a).await;
    let relay_b = allocate(&mut b).await;
    assert_ne!(relay_a, relay_b);
    assert_eq!(manager.session_count(), 2);
}

#[tokio::test]
async fn disconnect_removes_session_and_closes_peers() {
    let (addr, manager) = start_server().await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    let relay = allocate(&mut client).await;

    let mut peer = TcpStream::connect(relay).await.unwrap();
    let p = peer.local_addr().unwrap();
    expect_status(&mut client, p, ConnectionStatus::Established).await;

    drop(client);
    wait_for(|| manager.session_count() == 0).await;

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf))
        .await
        .expect("peer read timed out")
        .unwrap_or(0);
    assert_eq!(n, 0);
    wait_for(|| std::net::TcpStream::connect(relay).is_err()).await;
}

#[tokio::test]
async fn undecodable_frame_is_skipped() {
    let (addr, manager) = start_server().await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(&4u32.to_le_bytes()).await.unwrap();
    client.write_all(&[0xde, 0xad, 0xbe, 0xef]).await.unwrap();

    let relay = allocate(&mut client).await;
    assert_eq!(relay.ip(), IpAddr::from([127, 0, 0, 1]));
    assert_eq!(manager.session_count(), 1);
}

#[tokio::test]
async fn send_before_allocate_gets_no_answer() {
    let (addr, manager) = start_server().await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    send(
        &mut client,
        &TurnMessage::SendIndication {
            transaction_id: TransactionId::from_u128(9),
            peer: "127.0.0.1:9".parse().unwrap(),
            data: vec![0],
        },
    )
    .await;

    // The next thing the client hears is the allocate answer.
    let relay = allocate(&mut client).await;
    assert_ne!(relay.port(), 0);
    assert_eq!(manager.session_count(), 1);
}
