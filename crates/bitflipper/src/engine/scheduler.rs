//! Sequential batches of at most `parallel` concurrent connections.
//!
//! Batch `b` runs connections `b * parallel .. min((b + 1) * parallel, total)`
//! and the next batch only starts once every worker of the current one has
//! reported. The stop flag is checked before each batch.
//!
//! With [`ErrorPolicy::Abort`] the first failure cancels the remaining
//! workers of its batch through a batch-level child token and no further
//! batch is started. Cancelled siblings are reported as cancelled, not as
//! failures.

use crate::engine::port::{Binder, PortAllocator, TcpBinder};
use crate::engine::session::Session;
use crate::engine::worker::{run_connection, WorkerReport};
use crate::error::{FailureKind, WorkerError};
use bitflip_common::ErrorPolicy;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Aborted { index: u32, kind: FailureKind },
    Interrupted,
}

#[derive(Debug)]
pub struct RunSummary {
    pub attempted: u32,
    pub succeeded: u32,
    pub exchanges_completed: u64,
    pub failures: BTreeMap<FailureKind, u32>,
    pub batches_run: u32,
    pub peak_active: usize,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
    /// Per-connection outcomes ordered by connection index.
    pub reports: Vec<WorkerReport>,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            attempted: 0,
            succeeded: 0,
            exchanges_completed: 0,
            failures: BTreeMap::new(),
            batches_run: 0,
            peak_active: 0,
            elapsed: Duration::ZERO,
            stop_reason: StopReason::Completed,
            reports: Vec::new(),
        }
    }

    fn record(&mut self, report: WorkerReport) {
        self.attempted += 1;
        match &report.result {
            Ok(()) => self.succeeded += 1,
            Err(e) => *self.failures.entry(e.kind()).or_insert(0) += 1,
        }
        self.reports.push(report);
    }

    pub fn failures_of(&self, kind: FailureKind) -> u32 {
        self.failures.get(&kind).copied().unwrap_or(0)
    }

    /// Failed connections, not counting cancelled ones.
    pub fn failed(&self) -> u32 {
        self.failures
            .iter()
            .filter(|(kind, _)| **kind != FailureKind::Cancelled)
            .map(|(_, n)| n)
            .sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Connections attempted: {}", self.attempted)?;
        writeln!(f, "Connections succeeded: {}", self.succeeded)?;
        writeln!(f, "Exchanges completed: {}", self.exchanges_completed)?;
        for (kind, count) in &self.failures {
            writeln!(f, "Failures ({kind}): {count}")?;
        }
        write!(f, "Run time: {:.2}s", self.elapsed.as_secs_f64())
    }
}

pub struct Scheduler<B = TcpBinder> {
    session: Arc<Session>,
    ports: Arc<PortAllocator<B>>,
}

impl Scheduler<TcpBinder> {
    pub fn new(session: Arc<Session>) -> Self {
        let settings = session.settings();
        let ports = PortAllocator::for_target(settings.target, &settings.ports);
        Self::with_allocator(session, Arc::new(ports))
    }
}

impl<B> Scheduler<B>
where
    B: Binder<Socket = TcpSocket> + 'static,
{
    pub fn with_allocator(session: Arc<Session>, ports: Arc<PortAllocator<B>>) -> Self {
        Self { session, ports }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn run(&self) -> RunSummary {
        let settings = self.session.settings();
        let total = settings.connections;
        let parallel = settings.parallel.max(1);
        let batches = total.div_ceil(parallel);
        let mut summary = RunSummary::new();

        info!(
            connections = total,
            parallel,
            batches,
            policy = ?settings.error_policy,
            "Run started"
        );

        for batch in 0..batches {
            if self.session.is_stopped() {
                info!(batch, "Stop requested, skipping remaining batches");
                summary.stop_reason = StopReason::Interrupted;
                break;
            }

            let first = batch * parallel;
            let size = parallel.min(total - first);
            let token = self.session.stop_token().child_token();
            let mut workers = JoinSet::new();
            for slot in 0..size {
                workers.spawn(run_connection(
                    first + slot,
                    Arc::clone(&self.session),
                    Arc::clone(&self.ports),
                    token.clone(),
                ));
            }
            summary.batches_run += 1;

            let mut pending: BTreeSet<u32> = (first..first + size).collect();
            let mut aborted = None;
            while let Some(joined) = workers.join_next().await {
                let report = match joined {
                    Ok(report) => report,
                    Err(e) => {
                        error!(batch, error = %e, "connection task panicked");
                        if settings.error_policy == ErrorPolicy::Abort {
                            token.cancel();
                        }
                        continue;
                    }
                };
                pending.remove(&report.index);

                if let Err(e) = &report.result {
                    let kind = e.kind();
                    if settings.error_policy == ErrorPolicy::Abort
                        && kind != FailureKind::Cancelled
                        && aborted.is_none()
                    {
                        error!(index = report.index, error = %e, "Aborting run after connection failure");
                        aborted = Some(StopReason::Aborted {
                            index: report.index,
                            kind,
                        });
                        token.cancel();
                    }
                }
                summary.record(report);
            }

            // Panicked tasks never produced a report. Their indices are the ones left over.
            for index in pending {
                if settings.error_policy == ErrorPolicy::Abort && aborted.is_none() {
                    aborted = Some(StopReason::Aborted {
                        index,
                        kind: FailureKind::Internal,
                    });
                }
                summary.record(WorkerReport {
                    index,
                    local_port: None,
                    exchanges: 0,
                    elapsed: Duration::ZERO,
                    result: Err(WorkerError::Panicked),
                });
            }
            debug!(batch, "batch finished");

            if let Some(reason) = aborted {
                summary.stop_reason = reason;
                break;
            }
        }

        if summary.stop_reason == StopReason::Completed && self.session.is_stopped() {
            summary.stop_reason = StopReason::Interrupted;
        }

        summary.reports.sort_by_key(|r| r.index);
        summary.exchanges_completed = self.session.exchanges_completed();
        summary.peak_active = self.session.peak_active_connections();
        summary.elapsed = self.session.gate().elapsed();

        match summary.stop_reason {
            StopReason::Completed => info!(
                attempted = summary.attempted,
                failed = summary.failed(),
                exchanges = summary.exchanges_completed,
                "Run finished"
            ),
            _ => warn!(
                attempted = summary.attempted,
                failed = summary.failed(),
                exchanges = summary.exchanges_completed,
                reason = ?summary.stop_reason,
                "Run stopped early"
            ),
        }
        summary
    }
}
