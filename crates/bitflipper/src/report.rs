//! Post-run statistics over the packet capture.
//!
//! `tshark` extracts one line per matching packet (`stream<TAB>port<TAB>...`).
//! Received packets carrying the payload character are healthy, received
//! packets carrying the marker character saw a bitflip. Source ports tie the
//! packets back to individual connections.

use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to run tshark: {0}")]
    Spawn(#[from] io::Error),

    #[error("tshark exited with {status}: {stderr}")]
    Failed {
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Ports from the second column of tshark field output.
pub fn parse_ports(output: &str) -> Vec<u16> {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .filter_map(|port| port.trim().parse().ok())
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub tx_packets: usize,
    pub rx_packets: usize,
    pub rx_corrupted: usize,
    pub connections: usize,
    pub corrupted_connections: usize,
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

impl CaptureStats {
    /// Builds the statistics from the three tshark extractions.
    pub fn from_fields(rx_ok: &str, rx_corrupted: &str, tx: &str) -> Self {
        let rx_packets = rx_ok.lines().filter(|l| !l.trim().is_empty()).count();
        let corrupted = parse_ports(rx_corrupted);
        let sent = parse_ports(tx);
        Self {
            tx_packets: sent.len(),
            rx_packets,
            rx_corrupted: corrupted.len(),
            connections: sent.iter().collect::<HashSet<_>>().len(),
            corrupted_connections: corrupted.iter().collect::<HashSet<_>>().len(),
        }
    }

    pub fn corrupted_packet_percent(&self) -> f64 {
        percent(self.rx_corrupted, self.rx_packets + self.rx_corrupted)
    }

    pub fn corrupted_connection_percent(&self) -> f64 {
        percent(self.corrupted_connections, self.connections)
    }
}

fn ip_field(ip: IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "ip",
        IpAddr::V6(_) => "ipv6",
    }
}

/// Display filter for packets from (`inbound`) or to the target containing `ch`.
pub fn display_filter(target: SocketAddr, inbound: bool, ch: char) -> String {
    let (dir, port_dir) = if inbound {
        ("src", "srcport")
    } else {
        ("dst", "dstport")
    };
    format!(
        "{}.{dir} == {} and tcp.{port_dir} == {} and tcp.payload contains \"{ch}\"",
        ip_field(target.ip()),
        target.ip(),
        target.port(),
    )
}

async fn tshark_fields(pcap: &Path, filter: &str, port_field: &str) -> Result<String, ReportError> {
    debug!(filter, "running tshark");
    let output = Command::new("tshark")
        .arg("-n")
        .arg("-r")
        .arg(pcap)
        .args(["-Y", filter, "-T", "fields", "-e", "tcp.stream", "-e", port_field, "-e", "frame"])
        .output()
        .await?;
    if !output.status.success() {
        return Err(ReportError::Failed {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub async fn analyze(
    pcap: &Path,
    target: SocketAddr,
    payload_char: char,
    marker: char,
) -> Result<CaptureStats, ReportError> {
    let rx_ok = tshark_fields(pcap, &display_filter(target, true, payload_char), "tcp.dstport").await?;
    let rx_bad = tshark_fields(pcap, &display_filter(target, true, marker), "tcp.dstport").await?;
    let tx = tshark_fields(pcap, &display_filter(target, false, payload_char), "tcp.srcport").await?;
    Ok(CaptureStats::from_fields(&rx_ok, &rx_bad, &tx))
}

pub struct Report {
    pub target: SocketAddr,
    pub hostname: String,
    pub when: DateTime<Local>,
    pub pcap: PathBuf,
    pub stats: CaptureStats,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(
            f,
            "Report for {}/{} at {}",
            self.target.ip(),
            self.hostname,
            self.when.format("%Y-%m-%d-%H:%M:%S")
        )?;
        writeln!(f)?;
        writeln!(f, "PCAP in {}", self.pcap.display())?;
        writeln!(f)?;
        writeln!(f, "OK packets: TX {}, RX {}", s.tx_packets, s.rx_packets)?;
        writeln!(
            f,
            "Bitflip packets: {} total, {:.3} % of all packets",
            s.rx_corrupted,
            s.corrupted_packet_percent()
        )?;
        writeln!(f)?;
        writeln!(f, "Total connections: {}", s.connections)?;
        write!(
            f,
            "Bitflip connections: {} total, {:.3} % of all connections",
            s.corrupted_connections,
            s.corrupted_connection_percent()
        )
    }
}
