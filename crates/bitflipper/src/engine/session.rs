use crate::engine::exchange::build_request;
use crate::engine::rate_gate::{saturating_secs, RateGate};
use crate::metrics;
use bitflip_common::{Config, ConfigError, ErrorPolicy, PortConfig};
use bytes::Bytes;
use chrono::{DateTime, Local};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Validated, immutable parameters of one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub connections: u32,
    pub parallel: u32,
    pub requests_per_connection: u32,
    pub rate: f64,
    pub target: SocketAddr,
    pub hostname: String,
    pub payload_char: char,
    pub payload_length: u32,
    pub timeout_margin: Duration,
    pub error_policy: ErrorPolicy,
    pub ports: PortConfig,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let ip = config.target.ip.ok_or(ConfigError::MissingTarget)?;
        let run = &config.run;
        Ok(Self {
            connections: run.connections,
            parallel: run.parallel,
            requests_per_connection: run.requests_per_connection,
            rate: run.rate,
            target: SocketAddr::new(ip, config.target.port),
            hostname: config.target.hostname.clone(),
            payload_char: run.payload_char,
            payload_length: run.payload_length,
            timeout_margin: saturating_secs(run.timeout_margin_secs),
            error_policy: run.error_policy,
            ports: config.ports.clone(),
        })
    }

    /// Upper bound on one connection's whole lifetime: `N / R + margin`.
    /// Very low rates saturate at `Duration::MAX`.
    pub fn connection_limit(&self) -> Duration {
        saturating_secs(f64::from(self.requests_per_connection) / self.rate)
            .saturating_add(self.timeout_margin)
    }
}

/// Run-wide state shared by the scheduler and every worker.
pub struct Session {
    settings: RunSettings,
    request: Bytes,
    started_at: DateTime<Local>,
    gate: RateGate,
    connections_started: AtomicU64,
    exchanges_completed: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    stop: CancellationToken,
}

impl Session {
    pub fn new(settings: RunSettings) -> Self {
        let request = build_request(
            settings.payload_char,
            settings.payload_length as usize,
            &settings.hostname,
            false,
        );
        let gate = RateGate::new(settings.rate);
        Self {
            settings,
            request,
            started_at: Local::now(),
            gate,
            connections_started: AtomicU64::new(0),
            exchanges_completed: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            stop: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(RunSettings::from_config(config)?))
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// The request written for every exchange.
    pub fn request(&self) -> Bytes {
        self.request.clone()
    }

    /// Wall-clock start of the run, shared with capture and reporting.
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn gate(&self) -> &RateGate {
        &self.gate
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn record_connection_started(&self) -> u64 {
        metrics::CONNECTIONS_STARTED.inc();
        self.connections_started.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn connections_started(&self) -> u64 {
        self.connections_started.load(Ordering::SeqCst)
    }

    pub fn record_exchange(&self) {
        metrics::EXCHANGES_COMPLETED.inc();
        self.exchanges_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exchanges_completed(&self) -> u64 {
        self.exchanges_completed.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections seen so far.
    pub fn peak_active_connections(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub(crate) fn connection_opened(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        metrics::ACTIVE_CONNECTIONS.inc();
    }

    pub(crate) fn connection_closed(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        metrics::ACTIVE_CONNECTIONS.dec();
    }
}
