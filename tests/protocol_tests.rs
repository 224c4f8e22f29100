use netmeter::config::Protocol;
use netmeter::protocol::{
    read_message, serialize_message, write_message, ControlMessage, PROTOCOL_VERSION,
};
use netmeter::Server;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::sleep;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn start_server(port: u16) {
    let server = Server::new(port, Some(LOCALHOST));
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    sleep(Duration::from_millis(100)).await;
}

async fn handshake(port: u16, request: ControlMessage) -> ControlMessage {
    let mut control = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    write_message(&mut control, &request).await.unwrap();
    read_message(&mut control).await.unwrap()
}

/// A request with zero parallel streams is rejected with a reason and no
/// session is created; the server remains available for the next client.
#[tokio::test]
async fn test_server_rejects_zero_parallel() {
    start_server(15301).await;

    let bad = ControlMessage::request(Protocol::Tcp, Duration::from_secs(5), 0, None, 1400);
    match handshake(15301, bad).await {
        ControlMessage::Rejected { reason } => assert!(reason.contains("parallel")),
        other => panic!("expected Rejected, got {other:?}"),
    }

    // Server still answers after rejecting
    let good = ControlMessage::request(Protocol::Tcp, Duration::from_secs(1), 1, None, 1400);
    match handshake(15301, good).await {
        ControlMessage::Accepted { data_port, .. } => assert_eq!(data_port, 15302),
        other => panic!("expected Accepted, got {other:?}"),
    }
}

/// A client built from a different protocol revision is turned away at the
/// handshake instead of misparsing traffic later.
#[tokio::test]
async fn test_server_rejects_version_mismatch() {
    start_server(15311).await;

    let stale = ControlMessage::TestRequest {
        version: PROTOCOL_VERSION + 1,
        protocol: Protocol::Tcp,
        duration_secs: 5,
        parallel: 1,
        bitrate: None,
        payload_size: 1400,
    };
    match handshake(15311, stale).await {
        ControlMessage::Rejected { reason } => assert!(reason.contains("version")),
        other => panic!("expected Rejected, got {other:?}"),
    }
}

/// UDP without a target bitrate cannot be paced and is rejected.
#[tokio::test]
async fn test_server_rejects_udp_without_bitrate() {
    start_server(15321).await;

    let bad = ControlMessage::request(Protocol::Udp, Duration::from_secs(5), 1, None, 1400);
    match handshake(15321, bad).await {
        ControlMessage::Rejected { reason } => assert!(reason.contains("bitrate")),
        other => panic!("expected Rejected, got {other:?}"),
    }
}

/// A truncated control message leaves the reader with a clean error, not a
/// hang or a partial parse.
#[tokio::test]
async fn test_truncated_message_fails_cleanly() {
    let msg = ControlMessage::rejected("whatever");
    let mut bytes = serialize_message(&msg).unwrap();
    bytes.truncate(bytes.len() - 3);

    let mut cursor = std::io::Cursor::new(bytes);
    assert!(read_message(&mut cursor).await.is_err());
}

/// Garbage on the control port never crashes the server; a well-formed
/// client afterwards is served normally.
#[tokio::test]
async fn test_server_survives_garbage_handshake() {
    start_server(15331).await;

    let mut garbage = TcpStream::connect(("127.0.0.1", 15331)).await.unwrap();
    garbage.write_all(b"\x00\x00\x00\x05hello").await.unwrap();
    drop(garbage);
    sleep(Duration::from_millis(100)).await;

    let good = ControlMessage::request(Protocol::Tcp, Duration::from_secs(1), 1, None, 1400);
    match handshake(15331, good).await {
        ControlMessage::Accepted { .. } => {}
        other => panic!("expected Accepted, got {other:?}"),
    }
}
