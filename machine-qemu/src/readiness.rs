use std::net::SocketAddr;
use std::time::Duration;

use machine::MachineError;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Pause after a connection that was accepted but produced no data.
const SILENT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Block until `addr` accepts a connection and sends at least one byte.
///
/// QEMU's user-mode forwarder accepts connections on the host port before the
/// guest's SSH daemon is listening, so a bare connect is not enough: the
/// forwarded connection is closed without data until the guest is up.
pub async fn wait_for_ssh(
    addr: SocketAddr,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), MachineError> {
    let deadline = Instant::now() + timeout;
    debug!(%addr, ?timeout, "waiting for guest ssh");

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(MachineError::Cancelled),
        result = tokio::time::timeout_at(deadline, probe_until_ready(addr)) => match result {
            Ok(()) => {
                info!(%addr, "guest ssh reachable");
                Ok(())
            }
            Err(_) => Err(MachineError::Timeout(format!(
                "guest ssh on {addr} not reachable after {timeout:?}"
            ))),
        },
    }
}

async fn probe_until_ready(addr: SocketAddr) {
    let mut attempts = 0u64;
    loop {
        attempts += 1;
        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                trace!(%addr, attempts, error = %e, "connect failed");
                tokio::task::yield_now().await;
                continue;
            }
        };

        let mut byte = [0u8; 1];
        match stream.read(&mut byte).await {
            Ok(n) if n > 0 => {
                debug!(%addr, attempts, "ssh banner received");
                return;
            }
            Ok(_) => trace!(%addr, attempts, "connection closed without data"),
            Err(e) => trace!(%addr, attempts, error = %e, "read failed"),
        }
        drop(stream);
        tokio::time::sleep(SILENT_RETRY_DELAY).await;
    }
}
