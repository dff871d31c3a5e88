use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Terminal failure of a single connection worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("transport error after {completed} exchanges: {source}")]
    Transport {
        completed: u32,
        #[source]
        source: io::Error,
    },

    #[error("peer closed the connection after {completed} of {expected} exchanges")]
    PeerClosed { completed: u32, expected: u32 },

    #[error("{completed} of {expected} exchanges finished within {limit:?}")]
    Timeout {
        limit: Duration,
        completed: u32,
        expected: u32,
    },

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("stop requested")]
    StopRequested,

    #[error("connection task panicked")]
    Panicked,
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no free local port for connection {index} after {attempts} attempts")]
    Exhausted { index: u32, attempts: u32 },

    #[error("candidate port {candidate} for connection {index} is outside the port range")]
    OutOfRange { index: u32, candidate: u32 },
}

/// Failure buckets used in the run summary and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    Connection,
    Timeout,
    AllocationExhausted,
    Internal,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connection => "connection",
            FailureKind::Timeout => "timeout",
            FailureKind::AllocationExhausted => "allocation_exhausted",
            FailureKind::Internal => "internal",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            WorkerError::Connect { .. }
            | WorkerError::Transport { .. }
            | WorkerError::PeerClosed { .. } => FailureKind::Connection,
            WorkerError::Timeout { .. } => FailureKind::Timeout,
            WorkerError::Allocation(_) => FailureKind::AllocationExhausted,
            WorkerError::Panicked => FailureKind::Internal,
            WorkerError::StopRequested => FailureKind::Cancelled,
        }
    }
}
