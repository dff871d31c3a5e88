use bitflip_common::{Config, LoggingConfig};
use bitflipper::capture::{self, PacketCapture};
use bitflipper::cli::Cli;
use bitflipper::metrics;
use bitflipper::preflight::{self, Probe};
use bitflipper::report::{self, Report};
use bitflipper::{RunSettings, Scheduler, Session, StopReason};
use clap::Parser;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use std::convert::Infallible;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &LoggingConfig) {
    let default_level = if config.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(config.json.then(|| fmt::layer().json().with_target(true)))
        .with((!config.json).then(|| fmt::layer()))
        .init();
}

async fn serve_run_metrics(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Response::new(Body::from(metrics::render_metrics())),
        (&Method::GET, "/health") => Response::new(Body::from("running")),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap_or_default(),
    };
    Ok(response)
}

/// Exposes the run's counters for scraping while the scheduler is busy.
async fn expose_metrics(port: u16) {
    metrics::register_metrics();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(serve_run_metrics))
        })),
        Err(e) => {
            warn!(port, error = %e, "Metrics endpoint unavailable, continuing without it");
            return;
        }
    };

    info!(port, "Run metrics exposed on /metrics");
    if let Err(e) = server.await {
        error!(port, error = %e, "Metrics endpoint stopped");
    }
}

async fn start_capture(
    config: &Config,
    settings: &RunSettings,
    stem: &str,
) -> Result<PacketCapture, capture::CaptureError> {
    let interface = match &config.capture.interface {
        Some(name) => name.clone(),
        None => capture::default_interface().await?,
    };
    let path = Path::new(&config.capture.output_dir).join(format!("{stem}.pcap"));
    PacketCapture::start(&config.capture, &interface, &path, settings.target).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_logging(&config.logging);

    let settings = RunSettings::from_config(&config)?;
    info!(
        connections = settings.connections,
        parallel = settings.parallel,
        requests = settings.requests_per_connection,
        length = settings.payload_length,
        rate = settings.rate,
        target = %settings.target,
        hostname = %settings.hostname,
        policy = ?settings.error_policy,
        capture = config.capture.enabled,
        "Testing"
    );

    preflight::verify_target(&Probe::from_settings(&settings)).await?;

    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            expose_metrics(port).await;
        });
    }

    let when = chrono::Local::now();
    let stem = capture::file_stem(settings.target, &settings.hostname, &when);
    let pcap = if config.capture.enabled {
        Some(start_capture(&config, &settings, &stem).await?)
    } else {
        None
    };

    let session = Arc::new(Session::new(settings.clone()));
    let interrupt = Arc::clone(&session);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight connections");
            interrupt.request_stop();
        }
    });

    let summary = Scheduler::new(Arc::clone(&session)).run().await;
    println!("{summary}");

    if let Some(pcap) = pcap {
        let path = pcap.stop().await;
        info!("Generating statistics");
        let marker = bitflip_common::corruption_marker(settings.payload_char);
        match report::analyze(&path, settings.target, settings.payload_char, marker).await {
            Ok(stats) => {
                let report = Report {
                    target: settings.target,
                    hostname: settings.hostname.clone(),
                    when,
                    pcap: path,
                    stats,
                };
                println!("\n{report}");
                let report_path =
                    Path::new(&config.capture.output_dir).join(format!("{stem}.txt"));
                fs::write(&report_path, format!("{report}\n\n{summary}\n"))?;
                info!(path = %report_path.display(), "Report written");
            }
            Err(e) => error!(error = %e, "Could not analyze capture"),
        }
    }

    match summary.stop_reason {
        StopReason::Aborted { index, kind } => {
            Err(format!("run aborted: connection {index} failed ({kind})").into())
        }
        _ => Ok(()),
    }
}
