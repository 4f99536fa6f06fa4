use std::path::{Path, PathBuf};

use async_trait::async_trait;
use machine::MachineError;
use tracing::info;

use crate::command::exec;
use crate::paths::with_suffix;

/// Public half of the keypair whose private key lives at `private_key`.
pub fn public_key_path(private_key: &Path) -> PathBuf {
    with_suffix(private_key, ".pub")
}

/// Generates the SSH keypair installed into the boot disk.
///
/// Abstracted as a trait so tests can skip `ssh-keygen`.
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Write a fresh keypair at `private_key` and return the public key bytes.
    async fn generate(&self, private_key: &Path) -> Result<Vec<u8>, MachineError>;
}

/// RSA keypair via `ssh-keygen`.
#[derive(Debug, Clone)]
pub struct SshKeygen {
    program: String,
}

impl SshKeygen {
    pub fn new(program: &Path) -> Self {
        Self {
            program: program.to_string_lossy().into_owned(),
        }
    }
}

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self, private_key: &Path) -> Result<Vec<u8>, MachineError> {
        let public_key = public_key_path(private_key);

        // ssh-keygen prompts before overwriting.
        for stale in [private_key, public_key.as_path()] {
            match tokio::fs::remove_file(stale).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(MachineError::BuildFailed(format!(
                        "remove {}: {e}",
                        stale.display()
                    )));
                }
            }
        }

        let path = private_key.display().to_string();
        exec(
            &self.program,
            &["-q", "-t", "rsa", "-b", "2048", "-N", "", "-f", &path],
        )
        .await
        .map_err(|e| e.into_build_error())?;

        let key = tokio::fs::read(&public_key).await.map_err(|e| {
            MachineError::BuildFailed(format!("read {}: {e}", public_key.display()))
        })?;
        info!(path = %private_key.display(), "ssh keypair generated");
        Ok(key)
    }
}
