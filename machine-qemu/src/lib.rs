mod command;
mod config;
mod disk;
mod instance;
mod keys;
mod lock;
mod machine;
mod paths;
mod ports;
mod prerequisites;
mod process;
mod qmp;
mod readiness;

#[cfg(test)]
mod testing;

pub use config::{CacheMode, IoMode, KillCommand, QemuConfig};
pub use disk::{FORMAT_SENTINEL, ImageTool, build_archive, build_seed};
pub use instance::Instance;
pub use keys::{KeyGenerator, SshKeygen, public_key_path};
pub use machine::{DEFAULT_SERVICE_PORT, DRIVER_NAME, GUEST_SSH_PORT, QemuMachine, map_run_status};
pub use paths::MachinePaths;
pub use ports::{PortLease, allocate_distinct, reserve};
pub use prerequisites::{check_prerequisites, kvm_available};
pub use process::{DaemonLauncher, Launcher, build_args};
pub use qmp::{ControlCommand, ControlReply, QmpClient, QmpError, run_status};
pub use readiness::wait_for_ssh;
