//! Unified error types for the WiFi connection manager.
//!
//! Every boundary error (driver, storage) converts into the single
//! crate-level [`Error`], keeping the public API's error handling uniform.
//! All variants are `Copy` so results can be passed between the worker task
//! and API callers without allocation.

use core::fmt;

use crate::ports::{DriverError, StorageError};

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible public operation funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The command is not legal in the current state.
    InvalidState,
    /// A blocking call did not observe its terminal condition in time.
    Timeout,
    /// The driver reported failure, or a terminal failure event was observed.
    Fail,
    /// Resource creation failed during initialization.
    NoMem,
    /// The command queue was full on a zero-wait post.
    QueueFull,
    /// A driver control call failed.
    Driver(DriverError),
    /// Persistent storage failed.
    Storage(StorageError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState => write!(f, "invalid state for this command"),
            Self::Timeout => write!(f, "timed out waiting for completion"),
            Self::Fail => write!(f, "operation failed"),
            Self::NoMem => write!(f, "resource allocation failed"),
            Self::QueueFull => write!(f, "command queue full"),
            Self::Driver(e) => write!(f, "driver: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
        }
    }
}

impl From<DriverError> for Error {
    fn from(e: DriverError) -> Self {
        Self::Driver(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
