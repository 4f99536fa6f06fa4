#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{0}")]
    Machine(#[from] machine::MachineError),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type DriverResult<T> = Result<T, DriverError>;
