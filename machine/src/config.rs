use serde::{Deserialize, Serialize};

pub const DEFAULT_CPU_COUNT: u32 = 1;
pub const DEFAULT_MEMORY_MB: u32 = 1024;
pub const DEFAULT_DISK_SIZE_MB: u64 = 20000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_count: u32,
    pub memory_mb: u32,
    /// Capacity added to the boot disk, in MB.
    pub disk_size_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_count: DEFAULT_CPU_COUNT,
            memory_mb: DEFAULT_MEMORY_MB,
            disk_size_mb: DEFAULT_DISK_SIZE_MB,
        }
    }
}
