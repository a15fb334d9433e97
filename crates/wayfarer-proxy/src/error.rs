//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error. Fatal at server start.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Template compilation error.
    #[error("pattern error: {0}")]
    Pattern(#[from] PatternError),

    /// Cache storage error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Configuration error surfaced during handler registration.
    #[error("config error: {0}")]
    Config(#[from] wayfarer_core::ConfigError),

    /// Proxy server error.
    #[error("proxy error: {0}")]
    Proxy(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate CA material.
    #[error("failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA material.
    #[error("failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA material.
    #[error("failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA material.
    #[error("failed to write CA: {0}")]
    Write(String),
}

/// Placeholder template compilation error.
#[derive(Debug, Error)]
pub enum PatternError {
    /// The expanded template did not compile as a regex.
    #[error("failed to compile template '{0}': {1}")]
    Compile(String, String),
}

/// Smart-cache storage error.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Disk IO failure in the persistent strategy.
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry (de)serialization failure.
    #[error("cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for proxy operations.
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
