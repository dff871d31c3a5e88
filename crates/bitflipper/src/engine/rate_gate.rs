//! Aggregate request-rate gate shared by every connection of a run.
//!
//! Each send takes a ticket from the run-wide sent counter. Ticket `k` may go
//! out once `elapsed * rate >= k`, so the wait for a ticket is computed
//! exactly and slept once instead of being polled. The first request of a
//! connection takes a ticket without waiting, which allows a short burst
//! above the target rate whenever a new batch starts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Returned by [`RateGate::acquire`] when the run was stopped during the wait.
#[derive(Debug, PartialEq, Eq)]
pub struct Stopped;

/// `secs` as a `Duration`, saturating at `Duration::MAX` instead of
/// panicking on values too large to represent.
pub fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

/// How long ticket `ticket` still has to wait at `elapsed` into the run.
/// `None` means it may be sent now.
pub fn required_wait(elapsed: Duration, rate: f64, ticket: u64) -> Option<Duration> {
    let elapsed = elapsed.as_secs_f64();
    let ticket = ticket as f64;
    if elapsed * rate >= ticket {
        return None;
    }
    Some(saturating_secs(ticket / rate - elapsed))
}

pub struct RateGate {
    rate: f64,
    started: Instant,
    sent: AtomicU64,
}

impl RateGate {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            started: Instant::now(),
            sent: AtomicU64::new(0),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Requests counted so far, including those still in flight.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Sent requests per second since the run started.
    pub fn achieved_rate(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.sent() as f64 / secs
    }

    /// Counts a request that is not subject to the gate (the first one on a
    /// connection) and returns its ticket.
    pub fn record_unthrottled(&self) -> u64 {
        self.sent.fetch_add(1, Ordering::SeqCst)
    }

    /// Reserves the next ticket and sleeps until it is due, or until `stop`
    /// fires.
    pub async fn acquire(&self, stop: &CancellationToken) -> Result<u64, Stopped> {
        let ticket = self.sent.fetch_add(1, Ordering::SeqCst);
        if let Some(wait) = required_wait(self.elapsed(), self.rate, ticket) {
            trace!(ticket, wait_ms = wait.as_millis() as u64, "rate gate holding request");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {},
                _ = stop.cancelled() => return Err(Stopped),
            }
        }
        Ok(ticket)
    }
}
