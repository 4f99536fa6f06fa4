mod cmd;
mod config;
mod error;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "qemu-driver", version)]
struct Cli {
    /// Driver config (YAML)
    #[arg(
        long,
        global = true,
        env = "QEMU_DRIVER_CONFIG",
        default_value = config::DEFAULT_CONFIG_FILE
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check host prerequisites (hypervisor, qemu-img, ssh-keygen, boot media)
    Check(cmd::MachineArgs),
    /// Provision a new machine and boot it
    Create(cmd::MachineArgs),
    /// Boot an existing machine and wait for SSH
    Start(cmd::MachineArgs),
    /// Request an ACPI power-down
    Stop(cmd::MachineArgs),
    /// Stop the machine if running, then start it
    Restart(cmd::MachineArgs),
    /// Force the machine down
    Kill(cmd::MachineArgs),
    /// Terminate the hypervisor (disk and keys stay on disk)
    Rm(cmd::MachineArgs),
    /// Print the machine state
    Status(cmd::MachineArgs),
    /// Print the service URL
    Url(cmd::MachineArgs),
    /// Print the persisted instance and endpoints as JSON
    Inspect(cmd::MachineArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config;

    let result = match cli.command {
        Command::Check(args) => cmd::run_check(&config, args).await,
        Command::Create(args) => cmd::run_create(&config, args).await,
        Command::Start(args) => cmd::run_start(&config, args).await,
        Command::Stop(args) => cmd::run_stop(&config, args).await,
        Command::Restart(args) => cmd::run_restart(&config, args).await,
        Command::Kill(args) => cmd::run_kill(&config, args).await,
        Command::Rm(args) => cmd::run_remove(&config, args).await,
        Command::Status(args) => cmd::run_status(&config, args).await,
        Command::Url(args) => cmd::run_url(&config, args).await,
        Command::Inspect(args) => cmd::run_inspect(&config, args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
