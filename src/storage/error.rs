//! Storage Error Types

use thiserror::Error;

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Path does not exist in the document tree
    #[error("storage path not found: /{0}")]
    NotFound(String),

    /// Structural mismatch (writing into a scalar, bad array index)
    #[error("storage invariant violated: {0}")]
    Invariant(String),

    /// Write attempted through a read transaction
    #[error("cannot write in a read transaction")]
    ReadOnly,
}

impl StorageError {
    /// Error-taxonomy code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::NotFound(_) => "storage/not-found",
            StorageError::Invariant(_) | StorageError::ReadOnly => "storage/invariant",
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
