use machine::MachineError;
use tokio::process::Command;
use tracing::trace;

/// QEMU tools sometimes report failures on stderr while exiting 0.
const STDERR_ERROR_MARKER: &str = "error:";

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

impl CommandError {
    pub fn into_build_error(self) -> MachineError {
        MachineError::BuildFailed(self.to_string())
    }

    pub fn into_launch_error(self) -> MachineError {
        MachineError::LaunchFailed(self.to_string())
    }
}

/// Captured output of a successful command.
#[derive(Debug, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Format a human-readable display string for a direct command invocation.
fn format_command_display(program: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Execute a command.
///
/// Invokes the program binary directly with the given arguments, capturing
/// stdout and stderr separately. Fails on a nonzero exit status, and also on
/// a zero exit whose stderr carries an `error:` marker.
pub async fn exec(program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
    let cmd_display = format_command_display(program, args);
    trace!(command = %cmd_display, "exec");

    let output = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    trace!(command = %cmd_display, %stdout, %stderr, "exec output");

    if !output.status.success() {
        let detail = if stderr.is_empty() {
            output.status.to_string()
        } else {
            stderr
        };
        return Err(CommandError {
            command: cmd_display,
            detail,
        });
    }
    if stderr.contains(STDERR_ERROR_MARKER) {
        return Err(CommandError {
            command: cmd_display,
            detail: stderr,
        });
    }

    Ok(CommandOutput { stdout, stderr })
}
