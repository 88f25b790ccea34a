//! WolfCoord Error Types

use thiserror::Error;

/// Result type alias for WolfCoord operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCoord error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Storage errors
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Row already exists in {table}: {key}")]
    AlreadyExists { table: String, key: String },

    #[error("Row encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Election errors
    #[error("No leader available")]
    NoLeader,

    #[error("Leadership record names {0} but no member row exists")]
    StaleLeadershipReference(String),

    // Lifecycle errors
    #[error("Election already started")]
    AlreadyStarted,

    #[error("Shutdown in progress")]
    ShuttingDown,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is transient and the operation may succeed on the next tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable(_) | Error::Database(_) | Error::Io(_)
        )
    }

    /// Check if this error means the stored leadership points at a departed node
    pub fn is_stale_reference(&self) -> bool {
        matches!(self, Error::StaleLeadershipReference(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StorageUnavailable(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::StorageUnavailable("down".into()).is_retryable());
        assert!(!Error::NoLeader.is_retryable());
        assert!(!Error::ConfigurationInvalid("ttl".into()).is_retryable());
        assert!(Error::StaleLeadershipReference("node-2".into()).is_stale_reference());
    }
}
