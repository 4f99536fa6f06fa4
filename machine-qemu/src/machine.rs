use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use machine::{Driver, MachineError, MachineState};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{KillCommand, QemuConfig};
use crate::disk::{ImageTool, build_seed};
use crate::instance::Instance;
use crate::keys::{KeyGenerator, SshKeygen};
use crate::lock::{self, MachineLock};
use crate::paths::MachinePaths;
use crate::prerequisites::check_prerequisites;
use crate::process::{self, DaemonLauncher, Launcher};
use crate::qmp::{ControlCommand, ControlReply, QmpClient, QmpError, run_status};
use crate::{ports, readiness};

pub const DRIVER_NAME: &str = "qemu";
/// Guest port the SSH forward targets.
pub const GUEST_SSH_PORT: u16 = 22;
/// Guest port the service forward targets.
pub const DEFAULT_SERVICE_PORT: u16 = 2376;
const SSH_HOSTNAME: &str = "localhost";

/// Interval between status polls while waiting for the hypervisor to go away.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Map a raw `query-status` string to a machine state.
pub fn map_run_status(status: &str) -> MachineState {
    match status {
        "running" => MachineState::Running,
        "paused" => MachineState::Paused,
        "shutdown" => MachineState::Stopped,
        _ => MachineState::Unknown,
    }
}

/// Whether an error means nothing is serving the control socket anymore.
fn hypervisor_gone(e: &QmpError) -> bool {
    matches!(e, QmpError::Connect { .. } | QmpError::Closed)
}

/// A single QEMU-backed machine.
pub struct QemuMachine {
    config: QemuConfig,
    instance: Instance,
    paths: MachinePaths,
    qmp: QmpClient,
    launcher: Box<dyn Launcher>,
    keys: Box<dyn KeyGenerator>,
    cancel: CancellationToken,
}

impl QemuMachine {
    /// A machine that has not been created yet.
    pub fn new(name: &str, store_path: &Path, config: QemuConfig) -> Self {
        let instance = Instance::new(name, store_path, &config);
        Self::from_parts(config, instance)
    }

    /// Reopen a machine from its saved `config.json`.
    pub async fn open(
        name: &str,
        store_path: &Path,
        config: QemuConfig,
    ) -> Result<Self, MachineError> {
        let instance = Instance::load(store_path, name).await?;
        Ok(Self::from_parts(config, instance))
    }

    fn from_parts(config: QemuConfig, instance: Instance) -> Self {
        let paths = instance.paths();
        let qmp = QmpClient::new(&instance.monitor, config.qmp_timeout());
        let keys = SshKeygen::new(&config.ssh_keygen);
        Self {
            config,
            instance,
            paths,
            qmp,
            launcher: Box::new(DaemonLauncher),
            keys: Box::new(keys),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launcher = Box::new(launcher);
        self
    }

    pub fn with_key_generator(mut self, keys: impl KeyGenerator + 'static) -> Self {
        self.keys = Box::new(keys);
        self
    }

    /// Token that aborts a pending readiness wait when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn paths(&self) -> &MachinePaths {
        &self.paths
    }

    /// Persist the instance, e.g. after `url()` consumed the first-URL override.
    pub async fn save(&self) -> Result<(), MachineError> {
        self.instance.save().await
    }

    /// Virtual size of the boot disk in bytes.
    pub async fn disk_virtual_size(&self) -> Result<u64, MachineError> {
        ImageTool::new(&self.config.qemu_img)
            .virtual_size(&self.instance.disk)
            .await
    }

    async fn lock(&self) -> Result<MachineLock, MachineError> {
        tokio::fs::create_dir_all(self.paths.dir()).await?;
        lock::acquire(self.paths.lock()).await
    }

    async fn run(&self, command: ControlCommand) -> Result<ControlReply, MachineError> {
        Ok(self.qmp.execute(&command).await?)
    }

    /// Send `quit`. A hypervisor that is already gone counts as success.
    async fn quit(&self) -> Result<(), MachineError> {
        match self.qmp.execute(&ControlCommand::Quit).await {
            Ok(_) => Ok(()),
            Err(e) if hypervisor_gone(&e) => {
                debug!(name = %self.instance.name, error = %e, "hypervisor already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// State for lifecycle decisions. A hypervisor that has already exited
    /// counts as stopped; any other failure to read the status is `StateQuery`.
    async fn liveness(&self) -> Result<MachineState, MachineError> {
        match self.qmp.execute(&ControlCommand::QueryStatus).await {
            Ok(reply) => Ok(map_run_status(run_status(&reply).unwrap_or_default())),
            Err(e) if hypervisor_gone(&e) => {
                debug!(name = %self.instance.name, error = %e, "hypervisor not running");
                Ok(MachineState::Stopped)
            }
            Err(e) => Err(MachineError::StateQuery(e.to_string())),
        }
    }

    /// Poll `query-status` until `done` accepts the outcome.
    async fn poll_status(
        &self,
        what: &str,
        done: impl Fn(&Result<ControlReply, QmpError>) -> bool,
    ) -> Result<(), MachineError> {
        let timeout = self.config.ready_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let result = self.qmp.execute(&ControlCommand::QueryStatus).await;
            if done(&result) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(MachineError::Timeout(format!(
                    "{}: {what} after {timeout:?}",
                    self.instance.name
                )));
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(MachineError::Cancelled),
                () = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
            }
        }
    }

    /// Wait until the guest has left the running and paused states.
    async fn wait_powered_off(&self) -> Result<(), MachineError> {
        self.poll_status("guest still running", |result| match result {
            Ok(reply) => !matches!(
                map_run_status(run_status(reply).unwrap_or_default()),
                MachineState::Running | MachineState::Paused
            ),
            Err(e) => hypervisor_gone(e),
        })
        .await
    }

    /// Wait until nothing answers on the control socket.
    async fn wait_exited(&self) -> Result<(), MachineError> {
        self.poll_status("hypervisor did not exit", |result| match result {
            Ok(_) => false,
            Err(e) => hypervisor_gone(e),
        })
        .await
    }

    /// Make sure no live hypervisor owns the control socket.
    ///
    /// A powered-off hypervisor (`shutdown`) is told to quit and awaited. One
    /// that is running or paused is left alone and the start is refused.
    async fn retire_stale_process(&self) -> Result<(), MachineError> {
        let reply = match self.qmp.execute(&ControlCommand::QueryStatus).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(name = %self.instance.name, error = %e, "no live hypervisor");
                return Ok(());
            }
        };
        match map_run_status(run_status(&reply).unwrap_or_default()) {
            MachineState::Stopped => {
                info!(name = %self.instance.name, "retiring powered-off hypervisor");
                self.quit().await?;
                self.wait_exited().await
            }
            state => Err(MachineError::AlreadyRunning(format!(
                "{} is {state} on {}",
                self.instance.name,
                self.instance.monitor.display()
            ))),
        }
    }

    async fn start_unlocked(&self) -> Result<(), MachineError> {
        self.retire_stale_process().await?;

        let accel = self.config.accel_enabled();
        let args = process::build_args(&self.instance, accel);
        info!(
            name = %self.instance.name,
            ssh_port = self.instance.ssh_port,
            service_port = self.instance.service_port,
            cache = %self.instance.cache_mode,
            io = %self.instance.io_mode,
            accel,
            "launching hypervisor"
        );
        self.launcher.launch(&self.config.program, &args).await?;

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.instance.ssh_port));
        readiness::wait_for_ssh(addr, self.config.ready_timeout(), &self.cancel).await?;
        info!(name = %self.instance.name, "machine started");
        Ok(())
    }

    async fn stop_unlocked(&self) -> Result<(), MachineError> {
        self.run(ControlCommand::SystemPowerdown).await?;
        info!(name = %self.instance.name, "power-down requested");
        Ok(())
    }

    async fn kill_unlocked(&self) -> Result<(), MachineError> {
        match self.config.kill_command {
            KillCommand::SystemPowerdown => {
                self.run(ControlCommand::SystemPowerdown).await?;
            }
            KillCommand::Quit => self.quit().await?,
        }
        info!(name = %self.instance.name, command = ?self.config.kill_command, "machine killed");
        Ok(())
    }

    /// Copy the configured boot media into the machine directory.
    async fn stage_boot_media(&self) -> Result<(), MachineError> {
        let target = &self.instance.boot_media;
        tokio::fs::copy(&self.config.boot_media, target)
            .await
            .map_err(|e| {
                MachineError::BuildFailed(format!(
                    "copy {} to {}: {e}",
                    self.config.boot_media.display(),
                    target.display()
                ))
            })?;
        debug!(source = %self.config.boot_media.display(), "boot media staged");
        Ok(())
    }

    /// Build the seed directory from the userdata file, if any.
    ///
    /// An empty userdata file builds no seed.
    async fn build_seed_dir(&self) -> Result<Option<PathBuf>, MachineError> {
        let Some(userdata) = &self.instance.userdata else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(userdata).await.map_err(|e| {
            MachineError::BuildFailed(format!("read {}: {e}", userdata.display()))
        })?;
        if bytes.is_empty() {
            debug!(path = %userdata.display(), "userdata empty, no seed");
            return Ok(None);
        }
        build_seed(&self.paths.seed_root(), &bytes).await.map(Some)
    }
}

#[async_trait]
impl Driver for QemuMachine {
    fn driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn machine_name(&self) -> &str {
        &self.instance.name
    }

    async fn pre_create_check(&self) -> machine::Result<()> {
        let name = &self.instance.name;
        if name.is_empty() || name.contains('/') {
            return Err(MachineError::InvalidConfig(format!(
                "invalid machine name: {name:?}"
            )));
        }
        check_prerequisites(&self.config)
    }

    async fn create(&mut self) -> machine::Result<()> {
        let _lock = self.lock().await?;
        info!(name = %self.instance.name, dir = %self.paths.dir().display(), "creating machine");

        let ports = ports::allocate_distinct(2).await?;
        let &[ssh_port, service_port] = ports.as_slice() else {
            return Err(MachineError::AllocationExhausted);
        };
        self.instance.ssh_port = ssh_port;
        self.instance.service_port = service_port;

        self.stage_boot_media().await?;
        let public_key = self.keys.generate(&self.paths.ssh_key()).await?;
        ImageTool::new(&self.config.qemu_img)
            .build_boot_disk(
                &self.instance.disk,
                &public_key,
                self.instance.resources.disk_size_mb,
            )
            .await?;
        self.instance.seed_root = self.build_seed_dir().await?;
        self.instance.save().await?;

        self.start_unlocked().await
    }

    async fn start(&mut self) -> machine::Result<()> {
        let _lock = self.lock().await?;
        self.start_unlocked().await
    }

    async fn stop(&mut self) -> machine::Result<()> {
        let _lock = self.lock().await?;
        self.stop_unlocked().await
    }

    async fn kill(&mut self) -> machine::Result<()> {
        let _lock = self.lock().await?;
        self.kill_unlocked().await
    }

    async fn restart(&mut self) -> machine::Result<()> {
        let _lock = self.lock().await?;
        if self.liveness().await?.is_running() {
            self.stop_unlocked().await?;
            self.wait_powered_off().await?;
        }
        self.start_unlocked().await
    }

    async fn remove(&mut self) -> machine::Result<()> {
        let _lock = self.lock().await?;
        let killed_with_quit = if self.liveness().await?.is_running() {
            self.kill_unlocked().await?;
            self.config.kill_command == KillCommand::Quit
        } else {
            false
        };
        if !killed_with_quit {
            self.quit().await?;
        }
        info!(name = %self.instance.name, "machine removed");
        Ok(())
    }

    async fn state(&self) -> MachineState {
        match self.qmp.execute(&ControlCommand::QueryStatus).await {
            Ok(reply) => map_run_status(run_status(&reply).unwrap_or_default()),
            Err(e) => {
                warn!(name = %self.instance.name, error = %e, "status query failed");
                MachineState::Error(e.to_string())
            }
        }
    }

    fn ip(&self) -> machine::Result<IpAddr> {
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn ssh_hostname(&self) -> machine::Result<String> {
        Ok(SSH_HOSTNAME.to_string())
    }

    fn ssh_port(&self) -> u16 {
        match self.instance.ssh_port {
            0 => GUEST_SSH_PORT,
            port => port,
        }
    }

    fn ssh_username(&self) -> &str {
        &self.instance.ssh_user
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.paths.ssh_key()
    }

    fn port(&self) -> u16 {
        self.instance.service_port
    }

    fn url(&mut self) -> machine::Result<String> {
        let ip = self.ip()?;
        let port = if std::mem::take(&mut self.instance.first_url_pending) {
            DEFAULT_SERVICE_PORT
        } else {
            self.instance.service_port
        };
        Ok(format!("tcp://{ip}:{port}"))
    }
}
