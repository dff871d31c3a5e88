//! One-shot target check run before any capture or load.
//!
//! The target must echo the payload back, must not already contain the
//! corruption marker, and must keep the connection alive. Otherwise the
//! capture could not tell real bitflips from the target's normal output.

use crate::engine::exchange::{build_request, header_value, ResponseFramer, HEADER_TERMINATOR};
use crate::engine::session::RunSettings;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

pub const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error talking to target: {0}")]
    Io(#[from] io::Error),

    #[error("target did not answer within {0:?}")]
    Timeout(Duration),

    #[error("target closed the connection before a complete response")]
    ClosedEarly,

    #[error("response exceeds {0} bytes without completing")]
    ResponseTooLarge(usize),

    #[error("the payload is not echoed in the HTTP response")]
    PayloadNotEchoed,

    #[error("the response already contains the corruption marker {0:?}")]
    MarkerPresent(char),

    #[error("the target does not keep the connection alive")]
    KeepAliveMissing,
}

/// What the check sends and what it expects back.
#[derive(Debug, Clone)]
pub struct Probe {
    pub target: SocketAddr,
    pub hostname: String,
    pub payload_char: char,
    pub payload_length: usize,
}

impl Probe {
    pub fn from_settings(settings: &RunSettings) -> Self {
        Self {
            target: settings.target,
            hostname: settings.hostname.clone(),
            payload_char: settings.payload_char,
            payload_length: settings.payload_length as usize,
        }
    }

    pub fn marker(&self) -> char {
        bitflip_common::corruption_marker(self.payload_char)
    }

    fn payload(&self) -> Vec<u8> {
        vec![self.payload_char as u8; self.payload_length]
    }
}

/// Checks a complete response against the probe's expectations.
pub fn check_response(probe: &Probe, response: &[u8]) -> Result<(), PreflightError> {
    let payload = probe.payload();
    if !response.windows(payload.len()).any(|w| w == payload.as_slice()) {
        return Err(PreflightError::PayloadNotEchoed);
    }

    let marker = probe.marker();
    if response.contains(&(marker as u8)) {
        return Err(PreflightError::MarkerPresent(marker));
    }

    let head_len = response
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
        .unwrap_or(response.len());
    let keep_alive = header_value(&response[..head_len], "connection")
        .map(|v| v.to_ascii_lowercase().contains("keep-alive"))
        .unwrap_or(false);
    if !keep_alive {
        return Err(PreflightError::KeepAliveMissing);
    }

    Ok(())
}

async fn fetch(probe: &Probe) -> Result<Bytes, PreflightError> {
    let mut stream = TcpStream::connect(probe.target)
        .await
        .map_err(|source| PreflightError::Connect {
            addr: probe.target,
            source,
        })?;

    let request = build_request(
        probe.payload_char,
        probe.payload_length,
        &probe.hostname,
        true,
    );
    debug!(target_addr = %probe.target, bytes = request.len(), "preflight sending request");
    stream.write_all(&request).await?;

    let mut framer = ResponseFramer::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(response) = framer.next_response() {
            return Ok(response);
        }
        if framer.buffered() > MAX_RESPONSE_SIZE {
            return Err(PreflightError::ResponseTooLarge(MAX_RESPONSE_SIZE));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(PreflightError::ClosedEarly);
        }
        framer.push(&chunk[..n]);
    }
}

/// Runs the check once. Any error here must stop the run before it starts.
pub async fn verify_target(probe: &Probe) -> Result<(), PreflightError> {
    let response = timeout(PREFLIGHT_TIMEOUT, fetch(probe))
        .await
        .map_err(|_| PreflightError::Timeout(PREFLIGHT_TIMEOUT))??;
    debug!(
        bytes = response.len(),
        response = %String::from_utf8_lossy(&response),
        "preflight received response"
    );
    check_response(probe, &response)?;
    info!(target_addr = %probe.target, "Target echoes the payload and keeps connections alive");
    Ok(())
}
