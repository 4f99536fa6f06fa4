//! Ephemeral host port allocation.
//!
//! A port is found by binding `127.0.0.1:0` and reading back the number the
//! OS assigned. The result is best-effort: once the lease is released,
//! another process may claim the same port before QEMU binds it.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use machine::MachineError;
use tokio::net::TcpListener;
use tracing::{debug, trace};

/// Attempts before giving up on a usable port.
const MAX_ATTEMPTS: usize = 11;

/// Pause between attempts when the OS hands back port 0.
const RETRY_DELAY: Duration = Duration::from_millis(1);

/// A held ephemeral port. The port stays reserved until the lease is released
/// or dropped.
#[derive(Debug)]
#[must_use]
pub struct PortLease {
    listener: TcpListener,
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close the listener and hand back the port number.
    pub fn release(self) -> u16 {
        let port = self.port;
        drop(self.listener);
        port
    }
}

/// Reserve a free loopback TCP port.
pub async fn reserve() -> Result<PortLease, MachineError> {
    reserve_with(MAX_ATTEMPTS, |listener| Ok(listener.local_addr()?.port())).await
}

/// Bind `127.0.0.1:0` up to `attempts` times until `port_of` reads back a
/// nonzero port.
async fn reserve_with(
    attempts: usize,
    port_of: impl Fn(&TcpListener) -> std::io::Result<u16>,
) -> Result<PortLease, MachineError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    for attempt in 0..attempts {
        let listener = TcpListener::bind(addr).await?;
        let port = port_of(&listener)?;
        if port != 0 {
            trace!(port, attempt, "port reserved");
            return Ok(PortLease { listener, port });
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
    Err(MachineError::AllocationExhausted)
}

/// Allocate `count` pairwise-distinct ports.
///
/// All leases are held until every port is found, so the OS cannot hand the
/// same number out twice within one call.
pub async fn allocate_distinct(count: usize) -> Result<Vec<u16>, MachineError> {
    let mut leases: Vec<PortLease> = Vec::with_capacity(count);
    while leases.len() < count {
        let lease = reserve().await?;
        if leases.iter().any(|held| held.port() == lease.port()) {
            continue;
        }
        leases.push(lease);
    }
    let ports: Vec<u16> = leases.into_iter().map(PortLease::release).collect();
    debug!(?ports, "ports allocated");
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[tokio::test]
    async fn reserve_returns_nonzero_port() {
        let lease = reserve().await.unwrap();
        assert_ne!(lease.port(), 0);
    }

    #[tokio::test]
    async fn held_lease_blocks_rebinding() {
        let lease = reserve().await.unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, lease.port()));
        assert!(TcpListener::bind(addr).await.is_err());

        let port = lease.release();
        TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn distinct_ports_never_repeat() {
        for _ in 0..20 {
            let ports = allocate_distinct(2).await.unwrap();
            assert_eq!(ports.len(), 2);
            assert_ne!(ports[0], ports[1]);
            assert!(ports.iter().all(|p| *p != 0));
        }
    }

    #[tokio::test]
    async fn allocate_zero_ports_is_empty() {
        assert!(allocate_distinct(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn released_port_is_bindable() {
        let port = reserve().await.unwrap().release();
        TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn port_zero_on_every_attempt_exhausts() {
        let attempts = Cell::new(0usize);
        let err = reserve_with(MAX_ATTEMPTS, |_| {
            attempts.set(attempts.get() + 1);
            Ok(0)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, MachineError::AllocationExhausted), "{err}");
        assert_eq!(attempts.get(), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn port_zero_is_retried() {
        let attempts = Cell::new(0usize);
        let lease = reserve_with(MAX_ATTEMPTS, |listener| {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 3 {
                return Ok(0);
            }
            Ok(listener.local_addr()?.port())
        })
        .await
        .unwrap();
        assert_ne!(lease.port(), 0);
        assert_eq!(attempts.get(), 3);
    }
}
