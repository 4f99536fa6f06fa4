use std::path::Path;

use async_trait::async_trait;
use machine::MachineError;
use tracing::debug;

use crate::command::exec;
use crate::instance::Instance;
use crate::machine::{DEFAULT_SERVICE_PORT, GUEST_SSH_PORT};

/// 9p mount tag the guest's config-drive datasource looks for.
const SEED_MOUNT_TAG: &str = "config-2";

/// Build the hypervisor argument vector for `instance`.
///
/// The disk image is always the last argument.
pub fn build_args(instance: &Instance, accel: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-display".into(),
        "none".into(),
        "-m".into(),
        instance.resources.memory_mb.to_string(),
        "-smp".into(),
        instance.resources.cpu_count.to_string(),
        "-boot".into(),
        "d".into(),
        "-cdrom".into(),
        instance.boot_media.display().to_string(),
        "-qmp".into(),
        format!("unix:{},server,nowait", instance.monitor.display()),
        "-net".into(),
        "nic,vlan=0,model=virtio".into(),
        "-net".into(),
        format!(
            "user,vlan=0,hostfwd=tcp::{}-:{GUEST_SSH_PORT},hostfwd=tcp::{}-:{DEFAULT_SERVICE_PORT},hostname={}",
            instance.ssh_port, instance.service_port, instance.name
        ),
        "-daemonize".into(),
    ];

    if accel {
        args.push("-enable-kvm".into());
    }

    if let Some(seed) = &instance.seed_root {
        args.push("-fsdev".into());
        args.push(format!(
            "local,security_model=passthrough,readonly,id=fsdev0,path={}",
            seed.display()
        ));
        args.push("-device".into());
        args.push(format!(
            "virtio-9p-pci,id=fs0,fsdev=fsdev0,mount_tag={SEED_MOUNT_TAG}"
        ));
    }

    args.push(instance.disk.display().to_string());
    args
}

/// Starts the hypervisor process.
///
/// Abstracted as a trait so tests can stand in a fake hypervisor instead of
/// running QEMU.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, program: &Path, args: &[String]) -> Result<(), MachineError>;
}

/// Runs the hypervisor with `-daemonize`: the call returns once QEMU has
/// forked into the background.
pub struct DaemonLauncher;

#[async_trait]
impl Launcher for DaemonLauncher {
    async fn launch(&self, program: &Path, args: &[String]) -> Result<(), MachineError> {
        let program = program.to_string_lossy();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = exec(&program, &args)
            .await
            .map_err(|e| e.into_launch_error())?;
        debug!(stdout = %output.stdout, stderr = %output.stderr, "hypervisor daemonized");
        Ok(())
    }
}
