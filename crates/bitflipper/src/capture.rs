//! External packet capture around a run.
//!
//! `tcpdump` records all traffic between this host and the target while the
//! run is in progress. The capture is started before the session clock
//! begins and stopped once the scheduler has returned.

use bitflip_common::CaptureConfig;
use chrono::{DateTime, Local};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed {
        program: &'static str,
        status: std::process::ExitStatus,
    },

    #[error("no default IPv4 route found")]
    NoDefaultRoute,
}

/// Extracts the interface name from `ip -4 route show default` output.
pub fn parse_default_interface(route_output: &str) -> Option<String> {
    route_output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "dev" {
                return words.next().map(str::to_string);
            }
        }
        None
    })
}

pub async fn default_interface() -> Result<String, CaptureError> {
    let output = Command::new("ip")
        .args(["-4", "route", "show", "default"])
        .output()
        .await
        .map_err(|source| CaptureError::Spawn {
            program: "ip",
            source,
        })?;
    if !output.status.success() {
        return Err(CaptureError::Failed {
            program: "ip",
            status: output.status,
        });
    }
    parse_default_interface(&String::from_utf8_lossy(&output.stdout))
        .ok_or(CaptureError::NoDefaultRoute)
}

/// Common stem for the capture and report files of one run.
pub fn file_stem(target: SocketAddr, hostname: &str, when: &DateTime<Local>) -> String {
    format!(
        "bitflipper_{}_{}_{}",
        target.ip(),
        hostname,
        when.format("%Y-%m-%d-%H:%M:%S")
    )
}

/// BPF filter restricting the capture to traffic with the target.
pub fn capture_filter(target: SocketAddr) -> String {
    format!("host {} and port {}", target.ip(), target.port())
}

/// Sends SIGTERM to `pid`.
pub fn terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) only takes plain integers and reports failure via errno.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub struct PacketCapture {
    child: Child,
    path: PathBuf,
    stop_grace: Duration,
}

impl PacketCapture {
    pub async fn start(
        config: &CaptureConfig,
        interface: &str,
        path: &Path,
        target: SocketAddr,
    ) -> Result<Self, CaptureError> {
        let filter = capture_filter(target);
        let child = Command::new("tcpdump")
            .arg("-i")
            .arg(interface)
            .args(["-s", "0", "-U", "-w"])
            .arg(path)
            .arg(&filter)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                program: "tcpdump",
                source,
            })?;

        info!(interface, path = %path.display(), filter = %filter, "Packet capture started");
        sleep(Duration::from_millis(config.settle_ms)).await;

        Ok(Self {
            child,
            path: path.to_path_buf(),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Asks tcpdump to flush and exit, killing it after the grace period.
    pub async fn stop(mut self) -> PathBuf {
        if let Some(pid) = self.child.id() {
            match terminate(pid) {
                Ok(()) => debug!(pid, "sent SIGTERM to tcpdump"),
                Err(e) => warn!(pid, error = %e, "failed to signal tcpdump"),
            }
        }

        match timeout(self.stop_grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "tcpdump exited"),
            Ok(Err(e)) => warn!(error = %e, "failed waiting for tcpdump"),
            Err(_) => {
                warn!("tcpdump did not exit in time, killing it");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "failed to kill tcpdump");
                }
            }
        }

        info!(path = %self.path.display(), "Packet capture stopped");
        self.path
    }
}
