// src/sandbox/resource_limits.rs
//! Resource limits for task processes
//!
//! Provides control over:
//! - Memory consumption (address-space or `memory.max` ceiling)
//! - CPU usage (number of cores the task may run on)

use crate::utils::config::ResourceLimitsConfig;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Smallest memory ceiling accepted; below this most runtimes fail to start
pub const MIN_MEMORY_BYTES: u64 = 16 * 1024 * 1024;

/// cgroup v2 CPU accounting period in microseconds
pub const CPU_PERIOD_US: u64 = 100_000;

/// Resource limits for a task process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes
    /// Example: 536870912 = 512MB
    pub memory_bytes: Option<u64>,

    /// CPU cores the process may use
    /// Example: 2 = pinned to two cores, or 200% of `cpu.max`
    pub cpu_cores: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: Some(512 * 1024 * 1024),
            cpu_cores: Some(1),
        }
    }
}

impl ResourceLimits {
    /// Create resource limits with no restrictions
    pub fn unlimited() -> Self {
        Self {
            memory_bytes: None,
            cpu_cores: None,
        }
    }

    pub fn from_config(config: &ResourceLimitsConfig) -> Result<Self> {
        let limits = Self {
            memory_bytes: Some(config.memory_bytes()?),
            cpu_cores: Some(config.cpu_cores),
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Validate resource limits
    pub fn validate(&self) -> Result<()> {
        if let Some(memory) = self.memory_bytes {
            if memory < MIN_MEMORY_BYTES {
                return Err(EngineError::InvalidArgument(format!(
                    "memory limit {} bytes is below the {} byte minimum",
                    memory, MIN_MEMORY_BYTES
                )));
            }
        }

        if let Some(cores) = self.cpu_cores {
            if cores == 0 {
                return Err(EngineError::InvalidArgument(
                    "CPU core count cannot be 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Value for a cgroup v2 `cpu.max` file
    pub fn cpu_max(&self) -> String {
        match self.cpu_cores {
            Some(cores) => format!("{} {}", cores as u64 * CPU_PERIOD_US, CPU_PERIOD_US),
            None => format!("max {}", CPU_PERIOD_US),
        }
    }

    /// Value for a cgroup v2 `memory.max` file
    pub fn memory_max(&self) -> String {
        match self.memory_bytes {
            Some(bytes) => bytes.to_string(),
            None => "max".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let limits = ResourceLimits::from_config(&ResourceLimitsConfig {
            memory: "256MB".to_string(),
            cpu_cores: 2,
        })
        .unwrap();
        assert_eq!(limits.memory_bytes, Some(256 * 1024 * 1024));
        assert_eq!(limits.cpu_cores, Some(2));
    }

    #[test]
    fn test_validation() {
        assert!(ResourceLimits::default().validate().is_ok());
        assert!(ResourceLimits::unlimited().validate().is_ok());

        let tiny = ResourceLimits {
            memory_bytes: Some(1024),
            ..Default::default()
        };
        assert!(tiny.validate().is_err());

        let no_cores = ResourceLimits {
            cpu_cores: Some(0),
            ..Default::default()
        };
        assert!(no_cores.validate().is_err());
    }

    #[test]
    fn test_cgroup_values() {
        let limits = ResourceLimits {
            memory_bytes: Some(64 * 1024 * 1024),
            cpu_cores: Some(2),
        };
        assert_eq!(limits.cpu_max(), "200000 100000");
        assert_eq!(limits.memory_max(), "67108864");

        let unlimited = ResourceLimits::unlimited();
        assert_eq!(unlimited.cpu_max(), "max 100000");
        assert_eq!(unlimited.memory_max(), "max");
    }
}
