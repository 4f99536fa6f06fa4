use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use machine::ResourceLimits;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROGRAM: &str = "qemu-system-x86_64";
pub const DEFAULT_QEMU_IMG: &str = "qemu-img";
pub const DEFAULT_SSH_KEYGEN: &str = "ssh-keygen";
pub const DEFAULT_SSH_USER: &str = "docker";
const DEFAULT_READY_TIMEOUT_SECS: u64 = 300;
const DEFAULT_QMP_TIMEOUT_SECS: u64 = 10;

/// Driver configuration.
///
/// Tool locations are resolved by the caller and passed in here; nothing in
/// the backend looks them up through process-wide state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QemuConfig {
    /// Hypervisor binary.
    #[serde(default = "default_program")]
    pub program: PathBuf,
    /// Image conversion/resize tool.
    #[serde(default = "default_qemu_img")]
    pub qemu_img: PathBuf,
    #[serde(default = "default_ssh_keygen")]
    pub ssh_keygen: PathBuf,
    /// Base boot ISO, copied into the machine directory on create.
    pub boot_media: PathBuf,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub cache_mode: CacheMode,
    #[serde(default)]
    pub io_mode: IoMode,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Cloud-config userdata file exposed to the guest through the seed directory.
    #[serde(default)]
    pub userdata: Option<PathBuf>,
    /// Hardware acceleration. `None` probes `/dev/kvm` at launch time.
    #[serde(default)]
    pub accel: Option<bool>,
    #[serde(default)]
    pub kill_command: KillCommand,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_qmp_timeout_secs")]
    pub qmp_timeout_secs: u64,
    /// Report the well-known service port on the first `url()` call after
    /// configuration. Compatibility switch for older host tooling.
    #[serde(default)]
    pub first_url_default_port: bool,
}

impl QemuConfig {
    pub fn new(boot_media: PathBuf) -> Self {
        Self {
            program: default_program(),
            qemu_img: default_qemu_img(),
            ssh_keygen: default_ssh_keygen(),
            boot_media,
            resources: ResourceLimits::default(),
            cache_mode: CacheMode::default(),
            io_mode: IoMode::default(),
            ssh_user: default_ssh_user(),
            userdata: None,
            accel: None,
            kill_command: KillCommand::default(),
            ready_timeout_secs: DEFAULT_READY_TIMEOUT_SECS,
            qmp_timeout_secs: DEFAULT_QMP_TIMEOUT_SECS,
            first_url_default_port: false,
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn qmp_timeout(&self) -> Duration {
        Duration::from_secs(self.qmp_timeout_secs)
    }

    /// Whether to pass `-enable-kvm`.
    pub fn accel_enabled(&self) -> bool {
        self.accel.unwrap_or_else(crate::prerequisites::kvm_available)
    }
}

fn default_program() -> PathBuf {
    PathBuf::from(DEFAULT_PROGRAM)
}

fn default_qemu_img() -> PathBuf {
    PathBuf::from(DEFAULT_QEMU_IMG)
}

fn default_ssh_keygen() -> PathBuf {
    PathBuf::from(DEFAULT_SSH_KEYGEN)
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

fn default_ready_timeout_secs() -> u64 {
    DEFAULT_READY_TIMEOUT_SECS
}

fn default_qmp_timeout_secs() -> u64 {
    DEFAULT_QMP_TIMEOUT_SECS
}

/// Disk cache mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Default,
    None,
    Writethrough,
    Writeback,
    Directsync,
    Unsafe,
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::None => f.write_str("none"),
            Self::Writethrough => f.write_str("writethrough"),
            Self::Writeback => f.write_str("writeback"),
            Self::Directsync => f.write_str("directsync"),
            Self::Unsafe => f.write_str("unsafe"),
        }
    }
}

/// Disk IO mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    #[default]
    Threads,
    Native,
}

impl fmt::Display for IoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Threads => f.write_str("threads"),
            Self::Native => f.write_str("native"),
        }
    }
}

/// QMP command issued by `kill()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillCommand {
    /// ACPI power-down, same as `stop()`.
    #[default]
    SystemPowerdown,
    /// Terminate the hypervisor process immediately.
    Quit,
}
