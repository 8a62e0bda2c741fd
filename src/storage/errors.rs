use thiserror::Error;

/// Errors that can arise while interacting with the message store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when updating a message id that was never inserted.
    #[error("message not found: {0}")]
    NotFound(String),

    /// Returned when inserting an id that is already stored.
    #[error("message already exists: {0}")]
    AlreadyExists(String),
}
