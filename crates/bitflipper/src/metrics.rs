use lazy_static::lazy_static;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref CONNECTIONS_STARTED: IntCounter = IntCounter::new(
        "bitflipper_connections_started_total",
        "Total number of connections started"
    )
    .expect("metric can be created");
    pub static ref ACTIVE_CONNECTIONS: IntGauge = IntGauge::new(
        "bitflipper_active_connections",
        "Number of currently open connections"
    )
    .expect("metric can be created");
    pub static ref EXCHANGES_COMPLETED: IntCounter = IntCounter::new(
        "bitflipper_exchanges_completed_total",
        "Total number of framed responses received"
    )
    .expect("metric can be created");
    /// Failed connections, labelled by failure kind
    pub static ref CONNECTION_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "bitflipper_connection_failures_total",
            "Total number of connections that ended in failure"
        ),
        &["kind"]
    )
    .expect("metric can be created");
    pub static ref ACHIEVED_RATE: Gauge = Gauge::new(
        "bitflipper_achieved_rate",
        "Requests per second sent since the run started"
    )
    .expect("metric can be created");
}

pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(CONNECTIONS_STARTED.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(EXCHANGES_COMPLETED.clone()));
    let _ = REGISTRY.register(Box::new(CONNECTION_FAILURES.clone()));
    let _ = REGISTRY.register(Box::new(ACHIEVED_RATE.clone()));
}

/// Text exposition of every registered run metric.
pub fn render_metrics() -> String {
    let mut out = Vec::new();
    match TextEncoder::new().encode(&REGISTRY.gather(), &mut out) {
        Ok(()) => String::from_utf8_lossy(&out).into_owned(),
        Err(e) => format!("# bitflipper metrics unavailable: {e}\n"),
    }
}
