use std::fmt;

/// Externally visible machine state.
///
/// Backends map their raw status strings onto these variants; callers never
/// see a hypervisor-specific value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    Running,
    Paused,
    Stopped,
    /// The backend reported a status with no stable mapping (migration,
    /// transient or internal error substates).
    Unknown,
    /// The status query itself failed; carries the cause.
    Error(String),
}

impl MachineState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
            Self::Stopped => f.write_str("stopped"),
            Self::Unknown => f.write_str("unknown"),
            Self::Error(cause) => write!(f, "error ({cause})"),
        }
    }
}
