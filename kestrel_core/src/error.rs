//! Unified error handling for Kestrel
//!
//! This module provides the single error type shared by the reactor and both
//! receiver families, ensuring consistent error handling across the crate.
//! Errors are values everywhere: the hot path never unwinds, and only user
//! callbacks are allowed to panic (the reactor catches those at the dispatch
//! boundary).

use thiserror::Error;

/// Main error type for Kestrel operations
#[derive(Debug, Error)]
pub enum KestrelError {
    /// I/O related errors, carrying the underlying kernel code
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input/argument errors (zero interval, empty config, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The local port already has a subscription on this receiver
    #[error("Port {0} already has a subscription")]
    AddressInUse(u16),

    /// The per-receiver descriptor cap was hit
    #[error("Receiver descriptor cap reached ({limit})")]
    TooManyDescriptors { limit: usize },

    /// Unsubscribe/cancel for an unknown port, timer id, or descriptor
    #[error("Not found: {0}")]
    NotFound(String),

    /// Reactor registration with a descriptor that cannot be valid
    #[error("Bad descriptor: {0}")]
    BadDescriptor(i32),

    /// Malformed or unrecognized capture file
    #[error("Malformed capture: {0}")]
    Capture(String),
}

// Helper constructors, so call sites don't spell out `.into()`/`.to_string()`
impl KestrelError {
    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        KestrelError::InvalidInput(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        KestrelError::NotFound(msg.into())
    }

    /// Create a malformed-capture error
    pub fn capture<S: Into<String>>(msg: S) -> Self {
        KestrelError::Capture(msg.into())
    }

    /// Build an `Io` error from the calling thread's `errno`
    pub(crate) fn last_os_error() -> Self {
        KestrelError::Io(std::io::Error::last_os_error())
    }
}

/// Convenience type alias for Results using KestrelError
pub type KestrelResult<T> = std::result::Result<T, KestrelError>;

/// Short alias — `Result<T>` is equivalent to `KestrelResult<T>`
pub type Result<T> = KestrelResult<T>;
