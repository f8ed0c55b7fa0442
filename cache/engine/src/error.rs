//! Error types for engine operations.

use thiserror::Error;

/// Errors that can occur while preparing or running a request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// Cache-line locks could not be obtained for the request.
    #[error("cache line lock not acquired")]
    NoLock,

    /// The request's mapping changed while it was suspended.
    #[error("inconsistent request mapping")]
    Inval,

    /// Not enough free cache lines and eviction could not supply more.
    #[error("no cache lines available for mapping")]
    NoSpace,

    /// The cleaner failed to flush dirty lines for this request.
    #[error("cleaning failed")]
    Cleaning,

    /// An I/O error was reported by a backing device.
    #[error("device I/O error")]
    Io,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
