use std::path::{Path, PathBuf};

use machine_qemu::QemuConfig;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};

pub(crate) const DEFAULT_CONFIG_FILE: &str = "qemu-driver.yaml";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Root of the machine store; machines live under `<store_path>/machines/`.
    pub store_path: PathBuf,
    pub qemu: QemuConfig,
}

/// Load and validate a driver config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent
/// directory. Bare tool names (no path separator) are left for `PATH` lookup.
pub async fn load(path: &Path) -> DriverResult<DriverConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DriverError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: DriverConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| DriverError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    validate(&config).await?;
    Ok(config)
}

async fn check_path_exists(path: &Path, label: &str) -> DriverResult<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| DriverError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(DriverError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

async fn validate(config: &DriverConfig) -> DriverResult<()> {
    let resources = &config.qemu.resources;
    if resources.cpu_count == 0 {
        return Err(DriverError::Config("resources.cpu_count must be > 0".into()));
    }
    if resources.memory_mb == 0 {
        return Err(DriverError::Config("resources.memory_mb must be > 0".into()));
    }
    if config.qemu.ready_timeout_secs == 0 || config.qemu.qmp_timeout_secs == 0 {
        return Err(DriverError::Config("timeouts must be > 0".into()));
    }
    // store_path is created on first `create`
    Ok(())
}

/// Check that the files a new machine is built from exist.
///
/// Existing machines boot from their staged copy, so only `check` and
/// `create` need the base media.
pub async fn check_sources(config: &DriverConfig) -> DriverResult<()> {
    check_path_exists(&config.qemu.boot_media, "boot media").await?;
    if let Some(userdata) = &config.qemu.userdata {
        check_path_exists(userdata, "userdata").await?;
    }
    Ok(())
}

impl DriverConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        let resolve_tool = |p: &mut PathBuf| {
            if p.is_relative() && p.components().count() > 1 {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.store_path);
        resolve(&mut self.qemu.boot_media);
        if let Some(userdata) = &mut self.qemu.userdata {
            resolve(userdata);
        }
        resolve_tool(&mut self.qemu.program);
        resolve_tool(&mut self.qemu.qemu_img);
        resolve_tool(&mut self.qemu.ssh_keygen);
    }
}
