//! Error types for Coinpit

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// Malformed address, amount or request.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The tip moved between reading it and appending a block on top of it.
    #[error("Stale tip: expected {expected}, found {found}")]
    StaleTip { expected: String, found: String },

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Bincode error: {0}")]
    Bincode(String),
}

impl ChainError {
    /// Recoverable errors are reported back to the caller; the rest abort the
    /// current attempt without touching persisted state.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChainError::Validation(_)
                | ChainError::InsufficientFunds { .. }
                | ChainError::NotFound(_)
                | ChainError::AlreadyExists(_)
                | ChainError::StaleTip { .. }
        )
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::Bincode(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::Io(format!("JSON: {}", err))
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChainError::InsufficientFunds {
            needed: 30,
            available: 10,
        };
        assert_eq!(err.to_string(), "Insufficient funds: needed 30, available 10");
        assert!(err.is_recoverable());
        assert!(!ChainError::SignatureVerification("bad".into()).is_recoverable());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ChainError = io.into();
        assert!(matches!(err, ChainError::Io(_)));
    }
}
