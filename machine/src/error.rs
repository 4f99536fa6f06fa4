#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("unable to allocate tcp port")]
    AllocationExhausted,

    #[error("disk build failed: {0}")]
    BuildFailed(String),

    #[error("hypervisor launch failed: {0}")]
    LaunchFailed(String),

    #[error("control channel error: {0}")]
    Protocol(String),

    #[error("{command} failed: {payload}")]
    CommandFailed { command: String, payload: String },

    #[error("state query failed: {0}")]
    StateQuery(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("machine already running: {0}")]
    AlreadyRunning(String),

    #[error("backend not available: {0}")]
    NotAvailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MachineError>;
