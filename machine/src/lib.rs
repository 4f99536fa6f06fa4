mod config;
mod driver;
mod error;
mod state;

pub use config::ResourceLimits;
pub use driver::Driver;
pub use error::{MachineError, Result};
pub use state::MachineState;
