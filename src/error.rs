//! Error types for the ticket store

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the ticket store
///
/// Expected cache outcomes (missing keys, rejected disk writes, lost
/// evictions) are not errors: the cache reports them through `Option`,
/// `bool` and [`TicketStatus::Lost`](crate::cache::TicketStatus::Lost).
/// These variants cover construction, configuration and the internal
/// helpers whose failures the tiers translate at their boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error tied to a specific path
    #[error("I/O error on {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload could not be serialized or deserialized
    #[error("Payload error: {0}")]
    Payload(String),

    /// JSON payload encoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Key is not one the cache generated
    #[error("Invalid ticket key: {0:?}")]
    InvalidKey(String),

    /// A tier cannot hold the entry
    #[error("Capacity exceeded: need {needed} bytes, {available} available")]
    CapacityExceeded { needed: u64, available: u64 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Attach a path to an I/O error
    pub(crate) fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoAt {
            path: path.into(),
            source,
        }
    }
}
