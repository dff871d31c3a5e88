use crate::engine::exchange::{Action, CloseReason, Exchange, ExchangeEvent};
use crate::engine::port::{Binder, PortAllocator};
use crate::engine::session::Session;
use crate::error::WorkerError;
use crate::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Outcome of one connection.
#[derive(Debug)]
pub struct WorkerReport {
    pub index: u32,
    pub local_port: Option<u16>,
    pub exchanges: u32,
    pub elapsed: Duration,
    pub result: Result<(), WorkerError>,
}

impl WorkerReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

struct ConnectionGuard<'a> {
    session: &'a Session,
}

impl<'a> ConnectionGuard<'a> {
    fn new(session: &'a Session) -> Self {
        session.connection_opened();
        Self { session }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.session.connection_closed();
    }
}

fn log_progress(index: u32, session: &Session) {
    let rate = session.gate().achieved_rate();
    let started = session.record_connection_started();
    metrics::ACHIEVED_RATE.set(rate);
    if index % 10 == 0 {
        info!(index, started, rate = %format_args!("{:.2}", rate), "Starting connection");
    } else {
        debug!(index, started, rate = %format_args!("{:.2}", rate), "Starting connection");
    }
}

/// Runs connection `index` to completion, failure, timeout or cancellation.
pub async fn run_connection<B>(
    index: u32,
    session: Arc<Session>,
    ports: Arc<PortAllocator<B>>,
    cancel: CancellationToken,
) -> WorkerReport
where
    B: Binder<Socket = TcpSocket>,
{
    let started = Instant::now();
    log_progress(index, &session);

    let (lease, socket) = match ports.allocate(index) {
        Ok(v) => v,
        Err(e) => {
            return WorkerReport {
                index,
                local_port: None,
                exchanges: 0,
                elapsed: started.elapsed(),
                result: Err(e.into()),
            }
        }
    };

    let settings = session.settings();
    let limit = settings.connection_limit();
    let mut exchange = Exchange::new(settings.requests_per_connection);

    let driven = timeout(
        limit,
        drive(index, &mut exchange, socket, &session, &cancel),
    )
    .await;
    let result = match driven {
        Ok(result) => result,
        Err(_) => Err(WorkerError::Timeout {
            limit,
            completed: exchange.completed(),
            expected: exchange.expected(),
        }),
    };

    match &result {
        Ok(()) => debug!(index, port = lease.port(), "connection closed"),
        Err(WorkerError::StopRequested) => {
            debug!(index, port = lease.port(), "connection cancelled")
        }
        Err(e) => {
            metrics::CONNECTION_FAILURES
                .with_label_values(&[e.kind().as_str()])
                .inc();
            warn!(index, port = lease.port(), error = %e, "connection failed");
        }
    }

    WorkerReport {
        index,
        local_port: Some(lease.port()),
        exchanges: exchange.completed(),
        elapsed: started.elapsed(),
        result,
    }
}

async fn drive(
    index: u32,
    exchange: &mut Exchange,
    socket: TcpSocket,
    session: &Session,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let addr = session.settings().target;
    let mut stream: TcpStream = tokio::select! {
        res = socket.connect(addr) => res.map_err(|source| WorkerError::Connect { addr, source })?,
        _ = cancel.cancelled() => return Err(WorkerError::StopRequested),
    };
    let _guard = ConnectionGuard::new(session);

    let request = session.request();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut action = exchange.handle(ExchangeEvent::Connected);
    let mut recorded = 0;

    loop {
        while recorded < exchange.completed() {
            recorded += 1;
            session.record_exchange();
            debug!(index, completed = recorded, "response received");
        }

        action = match action {
            Action::SendRequest { gated } => {
                if gated && session.gate().acquire(cancel).await.is_err() {
                    exchange.handle(ExchangeEvent::StopRequested)
                } else {
                    if !gated {
                        session.gate().record_unthrottled();
                    }
                    stream
                        .write_all(&request)
                        .await
                        .map_err(|source| WorkerError::Transport {
                            completed: exchange.completed(),
                            source,
                        })?;
                    debug!(index, exchange = exchange.completed() + 1, "request sent");
                    exchange.handle(ExchangeEvent::RequestSent)
                }
            }
            Action::AwaitData => {
                let read = tokio::select! {
                    res = stream.read(&mut chunk) => Some(res),
                    _ = cancel.cancelled() => None,
                };
                match read {
                    None => exchange.handle(ExchangeEvent::StopRequested),
                    Some(Ok(0)) => exchange.handle(ExchangeEvent::PeerClosed),
                    Some(Ok(n)) => {
                        trace!(index, data = %String::from_utf8_lossy(&chunk[..n]), "data received");
                        exchange.handle(ExchangeEvent::DataReceived(&chunk[..n]))
                    }
                    Some(Err(source)) => {
                        return Err(WorkerError::Transport {
                            completed: exchange.completed(),
                            source,
                        })
                    }
                }
            }
            Action::Close(CloseReason::Completed) => {
                let _ = stream.shutdown().await;
                return Ok(());
            }
            Action::Close(CloseReason::PeerClosed { completed }) => {
                return Err(WorkerError::PeerClosed {
                    completed,
                    expected: exchange.expected(),
                })
            }
            Action::Close(CloseReason::Cancelled) => return Err(WorkerError::StopRequested),
        };
    }
}
