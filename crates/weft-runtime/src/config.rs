//! Runtime configuration
//!
//! Compile-time defaults with environment overrides, read once into a
//! process-global registry the first time a fiber is constructed.
//!
//! Environment variables:
//! - `WEFT_STACK_SIZE` - fiber stack size in bytes (default 128 KiB)

use std::sync::OnceLock;

use weft_core::env::env_get;
use weft_core::error::{RtError, RtResult};

/// Default fiber stack size
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Runtime configuration with builder-style setters
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size for task fibers created with `stack_size == 0`
    pub stack_size: usize,
}

impl RuntimeConfig {
    /// Compile-time defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("WEFT_STACK_SIZE", DEFAULT_STACK_SIZE),
        }
    }

    /// Explicit defaults, no environment override
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn validate(&self) -> RtResult<()> {
        if self.stack_size < 16 * 1024 {
            return Err(RtError::Config("stack_size must be >= 16 KiB"));
        }
        Ok(())
    }

    /// Install as the process-global configuration
    ///
    /// Must run before the first fiber is constructed; later calls fail.
    pub fn install(self) -> RtResult<()> {
        self.validate()?;
        CONFIG
            .set(self)
            .map_err(|_| RtError::Config("configuration already installed"))
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// The process-global configuration (installed, or defaults-from-env)
pub fn current() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::from_env)
}

/// Configured default fiber stack size
#[inline]
pub(crate) fn stack_size() -> usize {
    current().stack_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::new();
        assert_eq!(config.stack_size, 128 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new().stack_size(256 * 1024);
        assert_eq!(config.stack_size, 256 * 1024);
    }

    #[test]
    fn test_validation_rejects_tiny_stack() {
        let config = RuntimeConfig::new().stack_size(1024);
        assert!(config.validate().is_err());
    }
}
