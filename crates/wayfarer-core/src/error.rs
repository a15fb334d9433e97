//! Error types shared by configuration loading.

use thiserror::Error;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file declares an unsupported schema version.
    ///
    /// This disables custom handler registration but is not fatal for the
    /// bare proxy, which starts with zero handlers.
    #[error("config schema version {found} is outdated (expected {expected})")]
    SchemaOutdated { expected: u32, found: u32 },

    /// IO error while reading the config file.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// YAML deserialization error.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The config decoded but violates a schema invariant.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
