use std::path::Path;

use clap::Args;
use machine::{Driver, MachineState};
use machine_qemu::QemuMachine;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config;
use crate::error::{DriverError, DriverResult};

#[derive(Args)]
pub struct MachineArgs {
    /// Machine name
    #[arg(default_value = "default")]
    pub name: String,
}

/// Build a machine that has not been created yet.
async fn new_machine(config_path: &Path, name: &str) -> DriverResult<QemuMachine> {
    let config = config::load(config_path).await?;
    config::check_sources(&config).await?;
    Ok(QemuMachine::new(name, &config.store_path, config.qemu))
}

/// Reopen an existing machine from the store.
async fn open_machine(config_path: &Path, name: &str) -> DriverResult<QemuMachine> {
    let config = config::load(config_path).await?;
    Ok(QemuMachine::open(name, &config.store_path, config.qemu).await?)
}

/// Cancel the machine's pending waits on SIGINT or SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    tokio::spawn(async move {
        tokio::select! {
            _ = recv_signal(&mut sigterm) => warn!("SIGTERM received, cancelling"),
            _ = recv_signal(&mut sigint) => warn!("SIGINT received, cancelling"),
        }
        token.cancel();
    });
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

pub async fn run_check(config_path: &Path, args: MachineArgs) -> DriverResult<()> {
    let machine = new_machine(config_path, &args.name).await?;
    machine.pre_create_check().await?;
    println!("ok");
    Ok(())
}

pub async fn run_create(config_path: &Path, args: MachineArgs) -> DriverResult<()> {
    let mut machine = new_machine(config_path, &args.name).await?;
    machine.pre_create_check().await?;
    cancel_on_signal(machine.cancellation_token());
    machine.create().await?;
    info!(
        name = %args.name,
        ssh_port = machine.ssh_port(),
        port = machine.port(),
        "machine created"
    );
    Ok(())
}

pub async fn run_start(config_path: &Path, args: MachineArgs) -> DriverResult<()> {
    let mut machine = open_machine(config_path, &args.name).await?;
    cancel_on_signal(machine.cancellation_token());
    machine.start().await?;
    Ok(())
}

pub async fn run_stop(config_path: &Path, args: MachineArgs) -> DriverResult<()> {
    let mut machine = open_machine(config_path, &args.name).await?;
    machine.stop().await?;
    Ok(())
}

pub async fn run_restart(config_path: &Path, args: MachineArgs) -> DriverResult<()> {
    let mut machine = open_machine(config_path, &args.name).await?;
    cancel_on_signal(machine.cancellation_token());
    machine.restart().await?;
    Ok(())
}

pub async fn run_kill(config_path: &Path, args: MachineArgs) -> DriverResult<()> {
    let mut machine = open_machine(config_path, &args.name).await?;
    machine.kill().await?;
    Ok(())
}

pub async fn run_remove(config_path: &Path, args: MachineArgs) -> DriverResult<()> {
    let mut machine = open_machine(config_path, &args.name).await?;
    machine.remove().await?;
    Ok(())
}

pub async fn run_status(config_path: &Path, args: MachineArgs) -> DriverResult<()> {
    let machine = open_machine(config_path, &args.name).await?;
    println!("{}", machine.state().await);
    Ok(())
}

pub async fn run_url(config_path: &Path, args: MachineArgs) -> DriverResult<()> {
    let mut machine = open_machine(config_path, &args.name).await?;
    let pending = machine.instance().first_url_pending;
    let url = machine.url()?;
    if pending {
        // Persist that the one-shot override has been used.
        machine.save().await?;
    }
    println!("{url}");
    Ok(())
}

pub async fn run_inspect(config_path: &Path, args: MachineArgs) -> DriverResult<()> {
    let machine = open_machine(config_path, &args.name).await?;
    let state = machine.state().await;
    let disk_virtual_size = match machine.disk_virtual_size().await {
        Ok(size) => Some(size),
        Err(e) => {
            warn!(error = %e, "disk size unavailable");
            None
        }
    };

    let report = serde_json::json!({
        "driver": machine.driver_name(),
        "state": state.to_string(),
        "running": state == MachineState::Running,
        "ip": machine.ip()?.to_string(),
        "ssh": {
            "hostname": machine.ssh_hostname()?,
            "port": machine.ssh_port(),
            "user": machine.ssh_username(),
            "key": machine.ssh_key_path(),
        },
        "port": machine.port(),
        "disk_virtual_size": disk_virtual_size,
        "instance": machine.instance(),
    });
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| DriverError::Internal(format!("serialize report: {e}")))?;
    println!("{json}");
    Ok(())
}
