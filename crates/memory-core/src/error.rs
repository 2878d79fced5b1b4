//! ============================================================================
//! Error Types - Failure taxonomy for the memory engine
//! ============================================================================
//! Lower layers return `Result<T>` and propagate with `?`. The driver is the
//! only place that turns these into degraded-mode behaviour.
//! ============================================================================

use thiserror::Error;

/// Errors raised by the storage, index and embedding layers
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Could not allocate a unique id after {0} attempts")]
    IdExhausted(u32),

    #[error("Id {0} already exists")]
    IdCollision(u64),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Index training failed: {0}")]
    Training(String),

    #[error("Embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Hook failed: {0}")]
    Hook(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

macro_rules! storage_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for MemoryError {
                fn from(e: $ty) -> Self {
                    MemoryError::Storage(e.to_string())
                }
            }
        )*
    };
}

storage_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<bincode::Error> for MemoryError {
    fn from(e: bincode::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MemoryError::DimensionMismatch {
            expected: 768,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Vector dimension mismatch: expected 768, got 3"
        );
        assert!(MemoryError::IdExhausted(5).to_string().contains("5 attempts"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: MemoryError = io.into();
        assert!(matches!(err, MemoryError::Io(_)));
    }
}
