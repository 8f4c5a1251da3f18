//! Per-execution resource limits and their installation on a worker process.

use std::time::Duration;

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use serde::{Deserialize, Serialize};

/// Limits applied to every worker, identical for single and batch calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Wall-clock budget for one execution (one batch item).
    pub time_limit_seconds: u64,
    /// Address-space ceiling of the worker.
    pub memory_limit_bytes: u64,
    /// Largest file the worker may write.
    pub max_output_file_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time_limit_seconds: 30,
            memory_limit_bytes: 4 * 1024 * 1024 * 1024,
            max_output_file_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_seconds)
    }

    /// CPU-seconds ceiling. Slightly above the wall-clock budget so the
    /// wall-clock deadline normally fires first.
    pub fn cpu_backstop_seconds(&self) -> u64 {
        self.time_limit_seconds.saturating_add(1)
    }

    /// Install the limits on the calling process.
    ///
    /// Runs in the forked child before `exec`, so it only touches the
    /// worker and never the host process. Values above the inherited hard
    /// limit are clamped to it.
    pub fn apply(&self) -> nix::Result<()> {
        let cpu = self.cpu_backstop_seconds();
        lower(Resource::RLIMIT_CPU, cpu, cpu.saturating_add(1))?;
        lower(
            Resource::RLIMIT_AS,
            self.memory_limit_bytes,
            self.memory_limit_bytes,
        )?;
        lower(
            Resource::RLIMIT_FSIZE,
            self.max_output_file_bytes,
            self.max_output_file_bytes,
        )?;
        lower(Resource::RLIMIT_CORE, 0, 0)
    }
}

fn lower(resource: Resource, soft: u64, hard: u64) -> nix::Result<()> {
    let (_, inherited_hard) = getrlimit(resource)?;
    let hard = hard.min(inherited_hard);
    setrlimit(resource, soft.min(hard), hard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.time_limit_seconds, 30);
        assert_eq!(limits.memory_limit_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(limits.max_output_file_bytes, 10 * 1024 * 1024);
        assert_eq!(limits.time_limit(), Duration::from_secs(30));
    }

    #[test]
    fn test_cpu_backstop_exceeds_wall_clock() {
        let limits = ResourceLimits {
            time_limit_seconds: 2,
            ..Default::default()
        };
        assert_eq!(limits.cpu_backstop_seconds(), 3);

        let huge = ResourceLimits {
            time_limit_seconds: u64::MAX,
            ..Default::default()
        };
        assert_eq!(huge.cpu_backstop_seconds(), u64::MAX);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let limits: ResourceLimits = toml::from_str("time_limit_seconds = 5").unwrap();
        assert_eq!(limits.time_limit_seconds, 5);
        assert_eq!(limits.max_output_file_bytes, 10 * 1024 * 1024);
    }
}
