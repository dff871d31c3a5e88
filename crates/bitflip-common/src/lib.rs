use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

pub const MAX_CONNECTIONS: u32 = 10_000;
pub const MAX_PARALLEL: u32 = 25;
pub const MAX_REQUESTS_PER_CONNECTION: u32 = 1_000;
pub const MAX_PAYLOAD_LENGTH: u32 = 10_000;
pub const MAX_TIMEOUT_MARGIN_SECS: f64 = 86_400.0;

/// The character a single flipped low bit turns `payload_char` into (`@` for `A`).
pub fn corruption_marker(payload_char: char) -> char {
    char::from(payload_char as u8 ^ 0x01)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("rate must be a positive number of requests per second, got {0}")]
    InvalidRate(f64),

    #[error("timeout margin must be between 0 and {max} seconds, got {0}", max = MAX_TIMEOUT_MARGIN_SECS)]
    InvalidTimeoutMargin(f64),

    #[error("target IP address is required")]
    MissingTarget,

    #[error("hostname must be non-empty and contain no whitespace")]
    InvalidHostname,

    #[error("payload character {0:?} cannot be embedded in a request path")]
    InvalidPayloadChar(char),

    #[error("source port window {base}+{window} does not fit in the port range")]
    InvalidPortWindow { base: u16, window: u16 },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub run: RunConfig,
    pub target: TargetConfig,
    pub ports: PortConfig,
    pub capture: CaptureConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// What happens to the run when a single connection fails.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// The first failed connection ends the run.
    #[default]
    Abort,
    /// Failures are recorded per connection and the run keeps going.
    Continue,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunConfig {
    /// Total number of TCP connections, each from its own source port.
    pub connections: u32,
    /// Connections open at the same time (batch size).
    pub parallel: u32,
    /// HTTP requests sent over each connection.
    pub requests_per_connection: u32,
    /// Number of payload characters in each request path.
    pub payload_length: u32,
    /// Aggregate requests per second across all connections.
    pub rate: f64,
    pub payload_char: char,
    /// Added to `requests_per_connection / rate` to bound one connection's lifetime.
    pub timeout_margin_secs: f64,
    pub error_policy: ErrorPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            connections: 1000,
            parallel: 5,
            requests_per_connection: 10,
            payload_length: 3500,
            rate: 10.0,
            payload_char: 'A',
            timeout_margin_secs: 5.0,
            error_policy: ErrorPolicy::Abort,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TargetConfig {
    pub ip: Option<IpAddr>,
    pub port: u16,
    /// Sent in the `Host` header of every request.
    pub hostname: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            ip: None,
            port: 80,
            hostname: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PortConfig {
    pub base_offset: u16,
    pub window: u16,
    pub max_attempts: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            base_offset: 40_000,
            window: 20_000,
            max_attempts: 20_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    pub enabled: bool,
    /// Interface to capture on. Detected from the default route when unset.
    pub interface: Option<String>,
    pub output_dir: String,
    pub settle_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: None,
            output_dir: ".".to_string(),
            settle_ms: 1000,
            stop_grace_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    pub verbose: bool,
}

fn check_range(field: &'static str, value: u32, max: u32) -> Result<(), ConfigError> {
    if (1..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min: 1,
            max,
        })
    }
}

impl Config {
    pub fn from_yaml_str(data: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    /// Checks every value the run depends on. Nothing may connect to the
    /// target before this has passed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let run = &self.run;
        check_range("connections", run.connections, MAX_CONNECTIONS)?;
        check_range("parallel", run.parallel, MAX_PARALLEL)?;
        check_range(
            "requests_per_connection",
            run.requests_per_connection,
            MAX_REQUESTS_PER_CONNECTION,
        )?;
        check_range("payload_length", run.payload_length, MAX_PAYLOAD_LENGTH)?;

        if !run.rate.is_finite() || run.rate <= 0.0 {
            return Err(ConfigError::InvalidRate(run.rate));
        }
        let margin = run.timeout_margin_secs;
        if !(0.0..=MAX_TIMEOUT_MARGIN_SECS).contains(&margin) {
            return Err(ConfigError::InvalidTimeoutMargin(run.timeout_margin_secs));
        }

        let c = run.payload_char;
        if !c.is_ascii_graphic() || matches!(c, '/' | '?' | '#' | '%' | '"' | '\\') {
            return Err(ConfigError::InvalidPayloadChar(c));
        }

        if self.target.ip.is_none() {
            return Err(ConfigError::MissingTarget);
        }
        let host = &self.target.hostname;
        if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ConfigError::InvalidHostname);
        }

        let ports = &self.ports;
        if ports.window == 0 || u32::from(ports.base_offset) + u32::from(ports.window) > 65_536 {
            return Err(ConfigError::InvalidPortWindow {
                base: ports.base_offset,
                window: ports.window,
            });
        }

        Ok(())
    }
}
