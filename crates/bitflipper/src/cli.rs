//! Command-line surface. Flags override values from the optional YAML file.

use bitflip_common::{Config, ErrorPolicy};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// Check your connection for bitflips in packets
#[derive(Parser, Debug)]
#[command(name = "bitflipper")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// IP address to send HTTP requests to
    pub ip: IpAddr,

    /// Hostname to put in the HTTP Host header
    pub hostname: String,

    /// Total number of TCP connections to use, with unique source ports (1-10000)
    #[arg(short = 'C', long)]
    pub connections: Option<u32>,

    /// Number of parallel TCP connections, does not affect the total (1-25)
    #[arg(short = 'P', long)]
    pub parallel: Option<u32>,

    /// Number of HTTP requests to send per TCP connection (1-1000)
    #[arg(short = 'N', long = "num-requests")]
    pub num_requests: Option<u32>,

    /// Number of payload characters in each request (1-10000)
    #[arg(short = 'L', long)]
    pub length: Option<u32>,

    /// Number of HTTP requests per second across all connections
    #[arg(short = 'R', long)]
    pub rate: Option<f64>,

    /// TCP port of the target
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Character repeated in the request path
    #[arg(long)]
    pub payload_char: Option<char>,

    /// Seconds added to N/R before a connection is considered timed out
    #[arg(long)]
    pub timeout_margin: Option<f64>,

    /// Do not stop when a connection error occurs (most likely due to bitflips)
    #[arg(short = 'i', long)]
    pub ignore_errors: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// YAML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Skip tcpdump capture and the post-run report
    #[arg(long)]
    pub no_capture: bool,

    /// Capture interface (defaults to the interface of the default route)
    #[arg(long)]
    pub interface: Option<String>,

    /// Serve Prometheus metrics on this port during the run
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

impl Cli {
    /// Loads the config file if one was given, then applies the flags on top.
    pub fn load_config(&self) -> Result<Config, bitflip_common::ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    pub fn apply(&self, config: &mut Config) {
        let run = &mut config.run;
        if let Some(v) = self.connections {
            run.connections = v;
        }
        if let Some(v) = self.parallel {
            run.parallel = v;
        }
        if let Some(v) = self.num_requests {
            run.requests_per_connection = v;
        }
        if let Some(v) = self.length {
            run.payload_length = v;
        }
        if let Some(v) = self.rate {
            run.rate = v;
        }
        if let Some(v) = self.payload_char {
            run.payload_char = v;
        }
        if let Some(v) = self.timeout_margin {
            run.timeout_margin_secs = v;
        }
        if self.ignore_errors {
            run.error_policy = ErrorPolicy::Continue;
        }

        config.target.ip = Some(self.ip);
        config.target.hostname = self.hostname.clone();
        if let Some(port) = self.port {
            config.target.port = port;
        }

        if self.no_capture {
            config.capture.enabled = false;
        }
        if let Some(interface) = &self.interface {
            config.capture.interface = Some(interface.clone());
        }
        if let Some(port) = self.metrics_port {
            config.metrics.enabled = true;
            config.metrics.port = port;
        }

        config.logging.verbose |= self.verbose;
        config.logging.json |= self.json_logs;
    }
}
