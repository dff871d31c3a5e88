#![allow(dead_code)]

use bitflip_common::{Config, ErrorPolicy};
use bitflipper::RunSettings;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, Copy)]
pub enum PeerBehavior {
    /// Echo the request path back in a keep-alive response.
    Echo,
    /// Echo, but reset every n-th accepted connection right away.
    ResetEvery(usize),
    /// Read requests and never answer.
    Silent,
    /// Reset only the n-th accepted connection and stay silent on the others.
    ResetNth(usize),
    /// Echo, but answer with `Connection: close` semantics missing.
    EchoWithoutKeepAlive,
    /// Echo with the low bit of the first payload byte flipped.
    EchoCorrupted,
}

#[derive(Debug, Default)]
pub struct PeerStats {
    pub accepted: AtomicUsize,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
    pub requests: AtomicUsize,
}

impl PeerStats {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn request_path(request: &[u8]) -> Vec<u8> {
    let line_end = request
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(request.len());
    let line = &request[..line_end];
    line.split(|&b| b == b' ')
        .nth(1)
        .map(|p| p.strip_prefix(b"/").unwrap_or(p).to_vec())
        .unwrap_or_default()
}

fn response_for(behavior: PeerBehavior, request: &[u8]) -> Vec<u8> {
    let mut body = request_path(request);
    let connection = match behavior {
        PeerBehavior::EchoWithoutKeepAlive => "",
        _ => "Connection: keep-alive\r\n",
    };
    if let (PeerBehavior::EchoCorrupted, Some(first)) = (behavior, body.first_mut()) {
        *first ^= 0x01;
    }
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n{connection}Content-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.append(&mut body);
    response
}

async fn serve(mut stream: TcpStream, behavior: PeerBehavior, stats: Arc<PeerStats>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        while let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let request: Vec<u8> = buf.drain(..pos + 4).collect();
            stats.requests.fetch_add(1, Ordering::SeqCst);
            if matches!(behavior, PeerBehavior::Silent | PeerBehavior::ResetNth(_)) {
                continue;
            }
            if stream.write_all(&response_for(behavior, &request)).await.is_err() {
                return;
            }
        }
    }
}

/// Starts a stub target on an ephemeral local port.
pub async fn spawn_peer(behavior: PeerBehavior) -> (SocketAddr, Arc<PeerStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(PeerStats::default());
    let peer_stats = Arc::clone(&stats);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let accepted = peer_stats.accepted.fetch_add(1, Ordering::SeqCst) + 1;

            let reset = match behavior {
                PeerBehavior::ResetEvery(n) => accepted % n == 0,
                PeerBehavior::ResetNth(n) => accepted == n,
                _ => false,
            };
            if reset {
                #[allow(deprecated)]
                let _ = stream.set_linger(Some(Duration::ZERO));
                drop(stream);
                continue;
            }

            let stats = Arc::clone(&peer_stats);
            tokio::spawn(async move {
                let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
                stats.peak.fetch_max(now, Ordering::SeqCst);
                serve(stream, behavior, Arc::clone(&stats)).await;
                stats.active.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    (addr, stats)
}

/// Validated settings pointing at `target`.
pub fn settings(
    target: SocketAddr,
    connections: u32,
    parallel: u32,
    requests: u32,
    rate: f64,
    policy: ErrorPolicy,
    port_base: u16,
) -> RunSettings {
    let mut config = Config::default();
    config.run.connections = connections;
    config.run.parallel = parallel;
    config.run.requests_per_connection = requests;
    config.run.rate = rate;
    config.run.payload_length = 64;
    config.run.error_policy = policy;
    config.target.ip = Some(target.ip());
    config.target.port = target.port();
    config.target.hostname = "bitflip.test".to_string();
    config.ports.base_offset = port_base;
    config.ports.window = 1000;
    RunSettings::from_config(&config).unwrap()
}
