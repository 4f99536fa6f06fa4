use std::fs::File;
use std::path::PathBuf;

use machine::MachineError;
use nix::fcntl::{Flock, FlockArg};

/// Exclusive per-machine lock; released on drop.
pub type MachineLock = Flock<File>;

/// Acquire an exclusive flock on the given path, blocking until available.
///
/// Lifecycle operations on one machine hold this for their whole duration so
/// two processes never drive the same instance concurrently.
pub async fn acquire(path: PathBuf) -> Result<MachineLock, MachineError> {
    tokio::task::spawn_blocking(move || {
        let file = File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                MachineError::Io(std::io::Error::new(
                    e.kind(),
                    format!("open lock {}: {e}", path.display()),
                ))
            })?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_file, e)| {
            MachineError::Io(std::io::Error::other(format!(
                "flock {}: {e}",
                path.display()
            )))
        })
    })
    .await
    .map_err(|e| MachineError::Io(std::io::Error::other(format!("lock task: {e}"))))?
}
