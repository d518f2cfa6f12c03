//! Error types shared by the harness crates

use thiserror::Error;

/// Result type alias using the common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Shared error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid poll bounds: {0}")]
    InvalidBounds(String),

    #[error("Unknown poll profile: {0}")]
    UnknownProfile(String),

    #[error(
        "Timed out waiting for {expected} after {attempts} attempt(s) in {elapsed_ms} ms \
         (last value: {}, read errors: {read_errors}, last error: {})",
        .last_value.as_deref().unwrap_or("<none>"),
        .last_error.as_deref().unwrap_or("<none>")
    )]
    PollTimeout {
        expected: String,
        attempts: u32,
        elapsed_ms: u64,
        last_value: Option<String>,
        read_errors: u32,
        last_error: Option<String>,
    },

    #[error("Mismatch: expected {expected}, observed {observed}")]
    Mismatch { expected: String, observed: String },

    #[error("Read failed: {0}")]
    ReadFailed(String),
}
