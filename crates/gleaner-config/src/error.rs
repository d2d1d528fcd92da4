//! Configuration error types.

/// Result type alias for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of its legal range.
    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    /// Two `[[sources]]` tables share a name.
    #[error("source '{0}' is defined more than once")]
    DuplicateSource(String),
}
