//! Runtime configuration
//!
//! A process-wide configuration facade: build a [`RuntimeConfig`], then
//! [`install`](RuntimeConfig::install) it once before starting any scheduler.
//! Components read it through [`RuntimeConfig::get`], which falls back to the
//! defaults when nothing was installed.

use std::sync::OnceLock;

use crate::error::{SchedError, SchedResult};

/// Default fiber stack size: 128 KiB.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Default connect timeout: 5 s.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Configuration for the fiber runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack size per user fiber, in bytes
    pub stack_size: usize,

    /// Timeout applied to connects that do not specify one, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-fiber stack size
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Set the default connect timeout
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> SchedResult<()> {
        if self.stack_size == 0 {
            return Err(SchedError::InvalidConfig("stack_size must be non-zero"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(SchedError::InvalidConfig("connect_timeout_ms must be non-zero"));
        }
        Ok(())
    }

    /// Install this configuration process-wide.
    ///
    /// Must happen before the first scheduler starts; later calls fail.
    pub fn install(self) -> SchedResult<()> {
        self.validate()?;
        CONFIG
            .set(self)
            .map_err(|_| SchedError::InvalidConfig("configuration already installed"))
    }

    /// Read the installed configuration, or the defaults if none was installed.
    pub fn get() -> RuntimeConfig {
        CONFIG.get().copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = RuntimeConfig::default();
        assert_eq!(c.stack_size, 128 * 1024);
        assert_eq!(c.connect_timeout_ms, 5000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let c = RuntimeConfig::new().stack_size(64 * 1024).connect_timeout_ms(100);
        assert_eq!(c.stack_size, 64 * 1024);
        assert_eq!(c.connect_timeout_ms, 100);
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(RuntimeConfig::new().stack_size(0).validate().is_err());
        assert!(RuntimeConfig::new().connect_timeout_ms(0).validate().is_err());
    }
}
