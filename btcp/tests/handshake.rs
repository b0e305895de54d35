//! Integration tests for connection establishment and teardown.
//!
//! Most tests run both sockets over the in-memory simulator so faults can be
//! injected deterministically; the last one goes through real UDP sockets on
//! loopback.

use std::sync::Arc;
use std::time::Duration;

use btcp::{
    simulator::{self, FaultModel, SimLink},
    ClientSocket, ClientState, Config, ConnError, Flags, Segment, ServerSocket, ServerState,
    UdpTransport,
};
use tokio::net::UdpSocket;

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

struct Harness {
    client: ClientSocket,
    client_link: Arc<SimLink>,
    server: Arc<ServerSocket>,
}

fn fast_config() -> Config {
    Config::default()
        .with_window(8)
        .with_timeout(Duration::from_millis(20))
        .with_retries(5)
}

fn harness(config: Config, client_faults: FaultModel, server_faults: FaultModel) -> Harness {
    let ((client_link, client_rx), (server_link, server_rx)) =
        simulator::pair(client_faults, server_faults);
    let client = ClientSocket::new(config.clone(), client_link.clone(), client_rx).expect("client");
    let server = ServerSocket::new(config, server_link, server_rx).expect("server");
    Harness {
        client,
        client_link,
        server: Arc::new(server),
    }
}

/// Start listening, then finish `accept` in the background.
fn spawn_accept(server: &Arc<ServerSocket>) -> tokio::task::JoinHandle<Result<(), ConnError>> {
    server.listen();
    let server = Arc::clone(server);
    tokio::spawn(async move { server.accept().await })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Both sides report a connection after a clean handshake.
#[tokio::test]
async fn handshake_both_sides_established() {
    let h = harness(fast_config(), FaultModel::default(), FaultModel::default());
    let accept = spawn_accept(&h.server);

    tokio::time::timeout(Duration::from_secs(5), h.client.connect())
        .await
        .expect("client connect timed out")
        .expect("client connect failed");
    tokio::time::timeout(Duration::from_secs(5), accept)
        .await
        .expect("server accept timed out")
        .expect("server task panicked")
        .expect("server accept failed");

    assert_eq!(h.client.state(), ClientState::Established);
    assert_eq!(h.server.state(), ServerState::Established);
    assert!(h.client.is_connected());
    assert!(h.server.is_connected());
    assert_eq!(h.client_link.sends_with(Flags::SYN), 1);
    assert_eq!(h.client_link.sends_with(Flags::ACK), 1);
}

/// Every SYN lost: exactly `retries` attempts, then a timeout error.
#[tokio::test]
async fn connect_gives_up_after_retries() {
    let h = harness(fast_config(), FaultModel::default(), FaultModel::default());
    h.client_link
        .set_drop_rule(Box::new(|s: &Segment| s.flags == Flags::SYN));
    let _accept = spawn_accept(&h.server);

    let err = h.client.connect().await.unwrap_err();
    assert!(matches!(err, ConnError::ConnectTimeout { attempts: 5 }), "{err}");
    assert_eq!(h.client_link.sends_with(Flags::SYN), 5);
    assert_eq!(h.client.state(), ClientState::Closed);
    assert!(!h.client.is_connected());
}

/// A lost SYN is recovered by the next attempt.
#[tokio::test]
async fn lost_syn_is_retried() {
    let h = harness(fast_config(), FaultModel::default(), FaultModel::default());
    // First SYN never reaches the server.
    let mut first = true;
    h.client_link.set_drop_rule(Box::new(move |s: &Segment| {
        let drop = first && s.flags == Flags::SYN;
        if drop {
            first = false;
        }
        drop
    }));
    let accept = spawn_accept(&h.server);

    h.client.connect().await.expect("connect");
    accept.await.unwrap().unwrap();
    assert_eq!(h.client_link.sends_with(Flags::SYN), 2);
}

/// The handshake ACK is lost; the first data segment completes the server side.
#[tokio::test]
async fn first_data_segment_completes_handshake() {
    let h = harness(fast_config(), FaultModel::default(), FaultModel::default());
    h.client_link
        .set_drop_rule(Box::new(|s: &Segment| s.flags == Flags::ACK));
    let accept = spawn_accept(&h.server);

    h.client.connect().await.expect("connect");
    assert_eq!(h.server.state(), ServerState::SynAckSent);

    let server = Arc::clone(&h.server);
    let receive = tokio::spawn(async move { server.recv_all().await });
    h.client.send(b"hello").await.expect("send");

    accept.await.unwrap().unwrap();
    assert_eq!(receive.await.unwrap().unwrap(), b"hello");
    assert_eq!(h.server.state(), ServerState::Established);
}

/// Clean teardown: both sides end up closed and the server sees the event.
#[tokio::test]
async fn disconnect_closes_both_sides() {
    let h = harness(fast_config(), FaultModel::default(), FaultModel::default());
    let accept = spawn_accept(&h.server);
    h.client.connect().await.expect("connect");
    accept.await.unwrap().unwrap();

    h.client.disconnect().await;

    assert_eq!(h.client.state(), ClientState::Closed);
    assert!(!h.client.is_connected());
    assert!(h.server.wait_disconnected(Duration::from_secs(1)).await);
    assert_eq!(h.server.state(), ServerState::Closed);
    assert_eq!(h.client_link.sends_with(Flags::FIN), 1);
}

/// Teardown still completes locally when the server never answers.
#[tokio::test]
async fn disconnect_without_fin_ack_still_resets() {
    let h = harness(fast_config(), FaultModel::default(), FaultModel::default());
    let accept = spawn_accept(&h.server);
    h.client.connect().await.expect("connect");
    accept.await.unwrap().unwrap();

    h.client_link
        .set_drop_rule(Box::new(|s: &Segment| s.flags == Flags::FIN));
    h.client.disconnect().await;

    assert_eq!(h.client.state(), ClientState::Closed);
    assert_eq!(h.client_link.sends_with(Flags::FIN), 5);
    assert_eq!(h.server.state(), ServerState::Established);
}

#[tokio::test]
async fn send_before_connect_is_rejected() {
    let h = harness(fast_config(), FaultModel::default(), FaultModel::default());
    let err = h.client.send(b"too early").await.unwrap_err();
    assert!(matches!(err, ConnError::BadState { op: "send", .. }), "{err}");
    assert_eq!(h.client.state(), ClientState::Closed);
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let h = harness(fast_config(), FaultModel::default(), FaultModel::default());
    let accept = spawn_accept(&h.server);
    h.client.connect().await.expect("connect");
    accept.await.unwrap().unwrap();

    let err = h.client.connect().await.unwrap_err();
    assert!(matches!(err, ConnError::BadState { op: "connect", .. }), "{err}");
    assert_eq!(h.client.state(), ClientState::Established);
}

#[tokio::test]
async fn recv_without_connection_is_not_connected() {
    let h = harness(fast_config(), FaultModel::default(), FaultModel::default());
    assert!(matches!(h.server.recv().await, Err(ConnError::NotConnected)));
    assert!(matches!(h.server.try_recv(), Err(ConnError::NotConnected)));
}

#[tokio::test]
async fn accept_timeout_expires_without_client() {
    let h = harness(fast_config(), FaultModel::default(), FaultModel::default());
    let err = h
        .server
        .accept_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnError::AcceptTimeout(_)), "{err}");
    assert_eq!(h.server.state(), ServerState::Closed);
}

#[tokio::test]
async fn zero_window_config_is_rejected() {
    let ((link, rx), _) = simulator::pair(FaultModel::default(), FaultModel::default());
    let result = ClientSocket::new(Config::default().with_window(0), link, rx);
    assert!(matches!(result, Err(ConnError::Config(_))));
}

/// Full handshake over real UDP sockets on loopback.
#[tokio::test]
async fn handshake_over_udp_loopback() {
    let server_sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind server");
    let client_sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    let server_addr = server_sock.local_addr().unwrap();
    let client_addr = client_sock.local_addr().unwrap();

    let (server_transport, server_rx) = UdpTransport::from_socket(server_sock, client_addr).unwrap();
    let (client_transport, client_rx) = UdpTransport::from_socket(client_sock, server_addr).unwrap();
    assert_eq!(client_transport.peer, server_addr);

    let server = Arc::new(ServerSocket::new(fast_config(), server_transport, server_rx).unwrap());
    let client = ClientSocket::new(fast_config(), client_transport, client_rx).unwrap();

    let accept = spawn_accept(&server);
    tokio::time::timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    accept.await.unwrap().unwrap();

    let receiver = Arc::clone(&server);
    let receive = tokio::spawn(async move { receiver.recv_all().await });
    client.send(b"over the wire").await.expect("send");
    assert_eq!(receive.await.unwrap().unwrap(), b"over the wire");

    client.disconnect().await;
    assert!(server.wait_disconnected(Duration::from_secs(1)).await);
    client.close();
    server.close();
}
