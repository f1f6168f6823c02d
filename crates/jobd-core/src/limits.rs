//! Resource limits applied to every job.
//!
//! The daemon hands the configured limits to the launcher through the
//! environment; the launcher falls back to the reference defaults when a
//! variable is unset or unparsable.

use serde::{Deserialize, Serialize};

/// Default memory limit in megabytes.
pub const DEFAULT_MEMORY_MB: u64 = 10;

/// Default CPU shares (cgroup v1 `cpu.shares` scale).
pub const DEFAULT_CPU_SHARES: u64 = 512;

/// Environment variable carrying the memory limit to the launcher.
pub const MEMORY_MB_ENV: &str = "JOBD_MEMORY_MB";

/// Environment variable carrying the CPU shares to the launcher.
pub const CPU_SHARES_ENV: &str = "JOBD_CPU_SHARES";

/// Memory and CPU limits for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU shares on the cgroup v1 scale (1024 = one full share).
    pub cpu_shares: u64,
    // TODO: io bandwidth limits; blocked on carrying per-device major:minor
    // numbers in the config so the runner knows what to write.
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: DEFAULT_MEMORY_MB,
            cpu_shares: DEFAULT_CPU_SHARES,
        }
    }
}

impl ResourceLimits {
    /// The memory limit in bytes, as written to the cgroup controller.
    #[must_use]
    pub const fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }

    /// Environment entries for the daemon → launcher handoff.
    #[must_use]
    pub fn to_env(&self) -> [(&'static str, String); 2] {
        [
            (MEMORY_MB_ENV, self.memory_mb.to_string()),
            (CPU_SHARES_ENV, self.cpu_shares.to_string()),
        ]
    }

    /// Read limits from the process environment, defaulting any variable
    /// that is missing or malformed.
    #[must_use]
    pub fn from_env() -> Self {
        fn var(name: &str, default: u64) -> u64 {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
        Self {
            memory_mb: var(MEMORY_MB_ENV, DEFAULT_MEMORY_MB),
            cpu_shares: var(CPU_SHARES_ENV, DEFAULT_CPU_SHARES),
        }
    }
}
