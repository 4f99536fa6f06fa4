use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use crate::state::MachineState;

/// Lifecycle of a single machine as seen by a host-management tool.
///
/// Mutating operations take `&mut self`, so one driver value is never driven
/// by two lifecycle calls at once. Callers that share a driver across tasks
/// wrap it in a `tokio::sync::Mutex`.
#[async_trait]
pub trait Driver: Send + Sync {
    // -- identity --
    /// Backend name (e.g. "qemu").
    fn driver_name(&self) -> &str;
    fn machine_name(&self) -> &str;

    // -- lifecycle --
    /// Verify host prerequisites before `create()`.
    async fn pre_create_check(&self) -> Result<()>;
    /// Provision resources and boot the machine for the first time.
    async fn create(&mut self) -> Result<()>;
    async fn start(&mut self) -> Result<()>;
    /// Graceful shutdown request.
    async fn stop(&mut self) -> Result<()>;
    /// Forced shutdown.
    async fn kill(&mut self) -> Result<()>;
    async fn restart(&mut self) -> Result<()>;
    /// Tear down the running machine. On-disk artifacts are left in place.
    async fn remove(&mut self) -> Result<()>;

    // -- status --
    async fn state(&self) -> MachineState;
    fn ip(&self) -> Result<IpAddr>;
    fn ssh_hostname(&self) -> Result<String>;
    fn ssh_port(&self) -> u16;
    fn ssh_username(&self) -> &str;
    fn ssh_key_path(&self) -> PathBuf;
    /// Host port forwarded to the guest service.
    fn port(&self) -> u16;
    /// Service endpoint URL.
    fn url(&mut self) -> Result<String>;
}
