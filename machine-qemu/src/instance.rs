use std::path::{Path, PathBuf};

use machine::{MachineError, ResourceLimits};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CacheMode, IoMode, QemuConfig};
use crate::paths::MachinePaths;

/// Persisted description of one machine, stored as `config.json` in the
/// machine directory.
///
/// Ports are zero until `create()` allocates them and fixed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub store_path: PathBuf,
    pub resources: ResourceLimits,
    /// Host port forwarded to guest port 22.
    pub ssh_port: u16,
    /// Host port forwarded to the guest service port.
    pub service_port: u16,
    pub cache_mode: CacheMode,
    pub io_mode: IoMode,
    /// Staged boot media inside the machine directory.
    pub boot_media: PathBuf,
    pub disk: PathBuf,
    pub monitor: PathBuf,
    /// Seed directory root; `None` when no userdata was supplied.
    pub seed_root: Option<PathBuf>,
    pub ssh_user: String,
    pub userdata: Option<PathBuf>,
    /// Next `url()` reports the default service port instead of the
    /// allocated one.
    #[serde(default)]
    pub first_url_pending: bool,
}

impl Instance {
    pub fn new(name: &str, store_path: &Path, config: &QemuConfig) -> Self {
        let paths = MachinePaths::new(store_path, name);
        Self {
            name: name.to_string(),
            store_path: store_path.to_path_buf(),
            resources: config.resources.clone(),
            ssh_port: 0,
            service_port: 0,
            cache_mode: config.cache_mode,
            io_mode: config.io_mode,
            boot_media: paths.boot_media(),
            disk: paths.disk(),
            monitor: paths.monitor(),
            seed_root: None,
            ssh_user: config.ssh_user.clone(),
            userdata: config.userdata.clone(),
            first_url_pending: config.first_url_default_port,
        }
    }

    pub fn paths(&self) -> MachinePaths {
        MachinePaths::new(&self.store_path, &self.name)
    }

    /// Write `config.json`, replacing any previous copy.
    pub async fn save(&self) -> Result<(), MachineError> {
        let path = self.paths().config();
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| MachineError::InvalidConfig(format!("serialize instance: {e}")))?;
        tokio::fs::write(&path, json).await?;
        debug!(name = %self.name, path = %path.display(), "instance saved");
        Ok(())
    }

    /// Read a previously saved instance.
    pub async fn load(store_path: &Path, name: &str) -> Result<Self, MachineError> {
        let path = MachinePaths::new(store_path, name).config();
        let json = tokio::fs::read(&path).await.map_err(|e| {
            MachineError::Io(std::io::Error::new(
                e.kind(),
                format!("read {}: {e}", path.display()),
            ))
        })?;
        serde_json::from_slice(&json)
            .map_err(|e| MachineError::InvalidConfig(format!("parse {}: {e}", path.display())))
    }
}
