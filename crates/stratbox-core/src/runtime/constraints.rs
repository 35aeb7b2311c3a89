//! Hard resource caps applied by the container engine

use crate::config::{MIN_MEMORY_BYTES, RuntimeConfig};
use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Caps enforced at the engine boundary for one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConstraints {
    /// Memory cap; swap is capped to the same value
    pub memory_bytes: u64,
    /// CPU share, 1.0 is one core
    pub cpu_fraction: f64,
    /// Process and thread cap
    pub max_processes: u32,
    /// Size of the writable scratch tmpfs
    pub scratch_bytes: u64,
    /// Open file descriptor cap
    pub max_open_files: u32,
    /// Unprivileged `uid:gid`
    pub user: String,
}

impl ContainerConstraints {
    /// Configured defaults
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            memory_bytes: config.default_memory_bytes,
            cpu_fraction: config.default_cpu_fraction,
            max_processes: config.max_processes,
            scratch_bytes: config.scratch_bytes,
            max_open_files: config.max_open_files,
            user: config.user.clone(),
        }
    }

    /// Constraints for a request, clamped to the configured ceilings
    ///
    /// `None` fields take the configured defaults.
    pub fn for_request(
        config: &RuntimeConfig,
        memory_bytes: Option<u64>,
        cpu_fraction: Option<f64>,
    ) -> Self {
        let mut constraints = Self::from_config(config);

        if let Some(requested) = memory_bytes {
            let clamped = requested.clamp(MIN_MEMORY_BYTES, config.max_memory_bytes);
            if clamped != requested {
                warn!(requested, clamped, "Memory limit clamped");
            }
            constraints.memory_bytes = clamped;
        }

        if let Some(requested) = cpu_fraction {
            let clamped = if requested.is_finite() && requested > 0.0 {
                requested.min(config.max_cpu_fraction)
            } else {
                config.default_cpu_fraction
            };
            if clamped != requested {
                warn!(requested, clamped, "CPU fraction clamped");
            }
            constraints.cpu_fraction = clamped;
        }

        constraints
    }

    /// Reject caps the engine would refuse or silently ignore
    pub fn validate(&self) -> SandboxResult<()> {
        if self.memory_bytes < MIN_MEMORY_BYTES {
            return Err(SandboxError::invalid_request(format!(
                "memory limit {} is below the minimum of {} bytes",
                self.memory_bytes, MIN_MEMORY_BYTES
            )));
        }
        if !(self.cpu_fraction.is_finite() && self.cpu_fraction > 0.0) {
            return Err(SandboxError::invalid_request(format!(
                "cpu fraction {} must be positive",
                self.cpu_fraction
            )));
        }
        if self.max_processes == 0 {
            return Err(SandboxError::invalid_request("process limit must be > 0"));
        }
        let uid = self.user.split(':').next().unwrap_or_default();
        if uid.is_empty() || uid == "0" || uid == "root" {
            return Err(SandboxError::invalid_request(format!(
                "container user '{}' is privileged",
                self.user
            )));
        }
        Ok(())
    }
}
