pub mod capture;
pub mod cli;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod preflight;
pub mod report;

pub use engine::scheduler::{RunSummary, Scheduler, StopReason};
pub use engine::session::{RunSettings, Session};
pub use error::{FailureKind, WorkerError};
