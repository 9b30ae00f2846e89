//! Storage backend trait definition
//!
//! Defines the async interface the checkpoint core uses to talk to a
//! filesystem or object store. Single-directory rename is assumed atomic;
//! nothing in the core relies on atomic multi-directory operations.

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_core::Result;

/// Async trait for storage backends
///
/// Implementors provide file CRUD plus the directory operations the
/// checkpoint lifecycle contracts on: atomic rename, recursive prefix
/// removal, and directory listing.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read data from the given path
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if the path does not exist
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to the given path
    ///
    /// Creates parent directories if they don't exist. Uses atomic writes
    /// (write to temp, then rename).
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete the file at the given path
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path (file or directory) exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all file paths under a given prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomically rename a file or directory
    ///
    /// The commit primitive: promoting a temporary checkpoint directory to
    /// its permanent name goes through this single operation.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Recursively remove everything under a path; succeeds if the path is
    /// already absent
    async fn remove_prefix(&self, path: &str) -> Result<()>;

    /// List the immediate subdirectory names under a prefix, sorted
    async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>>;
}
