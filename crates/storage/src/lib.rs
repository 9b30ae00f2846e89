//! Storage - Backend trait and on-disk layouts for the checkpoint engine
//!
//! Provides async storage operations with support for:
//! - Local filesystem with atomic writes and atomic directory rename
//! - The aggregated layout (one manifest, few data files)
//! - The legacy one-directory-per-leaf layout (read + write)
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> checkpoint_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoints");
//! storage.write("7/model/data-0.bin", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("7/model/data-0.bin").await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
mod backend;
pub mod legacy;
mod local;

pub use backend::StorageBackend;
pub use local::LocalStorage;
