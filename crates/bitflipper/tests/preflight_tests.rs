mod common;

use bitflipper::preflight::{check_response, verify_target, PreflightError, Probe};
use common::{spawn_peer, PeerBehavior};
use std::net::SocketAddr;

fn probe(target: SocketAddr) -> Probe {
    Probe {
        target,
        hostname: "bitflip.test".to_string(),
        payload_char: 'A',
        payload_length: 32,
    }
}

#[test]
fn test_marker_is_low_bit_flip() {
    let p = probe(SocketAddr::from(([127, 0, 0, 1], 80)));
    assert_eq!(p.marker(), '@');
}

#[test]
fn test_check_response_accepts_echo() {
    let p = probe(SocketAddr::from(([127, 0, 0, 1], 80)));
    let response = format!(
        "HTTP/1.1 404 Not Found\r\nconnection: Keep-Alive\r\nContent-Length: 32\r\n\r\n{}",
        "A".repeat(32)
    );
    assert!(check_response(&p, response.as_bytes()).is_ok());
}

#[test]
fn test_check_response_rejects_short_echo() {
    let p = probe(SocketAddr::from(([127, 0, 0, 1], 80)));
    let response = format!(
        "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n\r\n{}",
        "A".repeat(31)
    );
    assert!(matches!(
        check_response(&p, response.as_bytes()),
        Err(PreflightError::PayloadNotEchoed)
    ));
}

#[test]
fn test_check_response_rejects_marker() {
    let p = probe(SocketAddr::from(([127, 0, 0, 1], 80)));
    let response = format!(
        "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nX-Contact: ops@example.com\r\n\r\n{}",
        "A".repeat(32)
    );
    assert!(matches!(
        check_response(&p, response.as_bytes()),
        Err(PreflightError::MarkerPresent('@'))
    ));
}

#[test]
fn test_check_response_requires_keep_alive_header() {
    let p = probe(SocketAddr::from(([127, 0, 0, 1], 80)));
    let response = format!("HTTP/1.1 200 OK\r\nServer: stub\r\n\r\n{}", "A".repeat(32));
    assert!(matches!(
        check_response(&p, response.as_bytes()),
        Err(PreflightError::KeepAliveMissing)
    ));
}

#[tokio::test]
async fn test_verify_target_against_echo_peer() {
    let (addr, peer) = spawn_peer(PeerBehavior::Echo).await;
    verify_target(&probe(addr)).await.unwrap();
    assert_eq!(peer.requests(), 1);
}

#[tokio::test]
async fn test_verify_target_without_keep_alive() {
    let (addr, _peer) = spawn_peer(PeerBehavior::EchoWithoutKeepAlive).await;
    let err = verify_target(&probe(addr)).await.unwrap_err();
    assert!(matches!(err, PreflightError::KeepAliveMissing));
}

#[tokio::test]
async fn test_verify_target_with_corrupted_echo() {
    let (addr, _peer) = spawn_peer(PeerBehavior::EchoCorrupted).await;
    let err = verify_target(&probe(addr)).await.unwrap_err();
    // One flipped byte breaks the echo before the marker check is reached.
    assert!(matches!(err, PreflightError::PayloadNotEchoed));
}

#[tokio::test]
async fn test_verify_target_connection_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = verify_target(&probe(addr)).await.unwrap_err();
    assert!(matches!(err, PreflightError::Connect { .. }));
}
