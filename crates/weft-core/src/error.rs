//! Error types for the weft runtime
//!
//! Programming errors (fiber state violations, double event registration,
//! context-switch failures) are asserted, not returned; this module covers
//! the recoverable cases.

use std::io;

use thiserror::Error;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RtError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Error)]
pub enum RtError {
    /// An OS call failed; the operation left no state behind
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Rejected configuration value
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// The calling thread has no scheduler installed
    #[error("no scheduler on this thread")]
    NoScheduler,
}

impl RtError {
    /// Capture `errno` for a failed OS call
    #[inline]
    pub fn os(op: &'static str) -> RtError {
        RtError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }
}
