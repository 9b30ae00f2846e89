//! Error types for the checkpoint persistence engine

use thiserror::Error;

/// Result type alias using the checkpoint Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the checkpoint persistence engine
#[derive(Error, Debug)]
pub enum Error {
    // Codec registry errors
    #[error("No codec registered for type tag: {type_tag}")]
    NotRegistered { type_tag: String },

    #[error("Codec already registered for type tag: {type_tag}")]
    AlreadyRegistered { type_tag: String },

    // Structure errors
    #[error("Structure mismatch at {path}: {reason}")]
    StructureMismatch { path: String, reason: String },

    // Step lifecycle errors
    #[error("Step not found: {step}")]
    StepNotFound { step: u64 },

    #[error("Incomplete write for step {step}: {message}")]
    IncompleteWrite { step: u64, message: String },

    #[error("Directory already exists: {path} (pass force_overwrite to replace)")]
    DirectoryConflict { path: String },

    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage { .. } | Error::Io(_))
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StructureMismatch { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
