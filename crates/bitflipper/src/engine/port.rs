//! Unique local source ports for outbound connections.
//!
//! Connection `i` first tries `cursor + (i % window)`. Every failed attempt
//! moves the run-wide cursor up by one and the formula is retried. The lock
//! around the cursor and the lease set is held across the whole candidate /
//! bind sequence and never across an `.await`, so two workers cannot leave
//! with the same port.

use crate::error::AllocationError;
use bitflip_common::PortConfig;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpSocket;
use tracing::{debug, warn};

/// Binds a fresh socket to a local address.
pub trait Binder: Send + Sync {
    type Socket: Send;

    fn bind(&self, addr: SocketAddr) -> io::Result<Self::Socket>;
}

/// Binds `SO_REUSEADDR` TCP sockets ready for `connect`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpBinder;

impl Binder for TcpBinder {
    type Socket = TcpSocket;

    fn bind(&self, addr: SocketAddr) -> io::Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket)
    }
}

#[derive(Debug)]
struct AllocatorState {
    cursor: u32,
    leased: HashSet<u16>,
}

type SharedState = Arc<Mutex<AllocatorState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, AllocatorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds a port for the lifetime of one connection.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    state: SharedState,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        lock(&self.state).leased.remove(&self.port);
    }
}

pub struct PortAllocator<B = TcpBinder> {
    binder: B,
    local_ip: IpAddr,
    window: u32,
    max_attempts: u32,
    state: SharedState,
}

impl PortAllocator<TcpBinder> {
    /// Allocator binding on the unspecified address of the target's family.
    pub fn for_target(target: SocketAddr, config: &PortConfig) -> Self {
        let local_ip = match target.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self::with_binder(TcpBinder, local_ip, config)
    }
}

impl<B: Binder> PortAllocator<B> {
    pub fn with_binder(binder: B, local_ip: IpAddr, config: &PortConfig) -> Self {
        Self {
            binder,
            local_ip,
            window: u32::from(config.window.max(1)),
            max_attempts: config.max_attempts.max(1),
            state: Arc::new(Mutex::new(AllocatorState {
                cursor: u32::from(config.base_offset),
                leased: HashSet::new(),
            })),
        }
    }

    /// Current base offset; only ever moves up.
    pub fn cursor(&self) -> u32 {
        lock(&self.state).cursor
    }

    pub fn leased(&self) -> usize {
        lock(&self.state).leased.len()
    }

    pub fn allocate(&self, index: u32) -> Result<(PortLease, B::Socket), AllocationError> {
        let mut state = lock(&self.state);

        for attempt in 1..=self.max_attempts {
            let candidate = state.cursor + index % self.window;
            let port = u16::try_from(candidate)
                .ok()
                .filter(|&p| p != 0)
                .ok_or(AllocationError::OutOfRange { index, candidate })?;

            if state.leased.contains(&port) {
                debug!(index, port, "local port already leased, advancing");
                state.cursor += 1;
                continue;
            }

            match self.binder.bind(SocketAddr::new(self.local_ip, port)) {
                Ok(socket) => {
                    state.leased.insert(port);
                    if attempt > 1 {
                        debug!(index, port, attempt, "bound local port after retries");
                    }
                    let lease = PortLease {
                        port,
                        state: Arc::clone(&self.state),
                    };
                    return Ok((lease, socket));
                }
                Err(e) => {
                    debug!(index, port, error = %e, "bind failed, advancing");
                    state.cursor += 1;
                }
            }
        }

        warn!(index, attempts = self.max_attempts, "local port allocation exhausted");
        Err(AllocationError::Exhausted {
            index,
            attempts: self.max_attempts,
        })
    }
}
