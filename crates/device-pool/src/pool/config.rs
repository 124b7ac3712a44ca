//! Pool configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the device pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicePoolConfig {
    /// Maximum number of non-default devices kept alive
    pub capacity: usize,
    /// Time allowed for popping error scopes on release
    pub release_timeout: Duration,
}

impl Default for DevicePoolConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            release_timeout: Duration::from_millis(5000),
        }
    }
}

impl DevicePoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::configuration("capacity must be greater than 0"));
        }
        if self.release_timeout.is_zero() {
            return Err(Error::configuration(
                "release_timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}
