//! Asynchronous checkpoint persistence
//!
//! The pieces compose bottom-up: handlers serialize one item into one
//! directory, the [`AsyncCheckpointer`] wraps a handler with snapshotting,
//! background writes and atomic commit, and the [`CheckpointManager`]
//! runs a whole root of numbered step directories on top of that.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use checkpoint::{CheckpointManager, CheckpointManagerConfig};
//! use checkpoint_core::RestoreOptions;
//! use storage::LocalStorage;
//!
//! # async fn run(state: checkpoint_core::CheckpointTree) -> checkpoint_core::Result<()> {
//! let storage = Arc::new(LocalStorage::new("/data/ckpt"));
//! let manager = CheckpointManager::new(CheckpointManagerConfig::default(), storage).await?;
//!
//! manager.save(100, &HashMap::from([("state".to_string(), state)])).await?;
//! manager.wait_until_finished().await?;
//!
//! let restored = manager.restore(100, None, &RestoreOptions::default()).await?;
//! # let _ = restored;
//! # Ok(())
//! # }
//! ```

pub mod checkpointer;
pub mod handler;
pub mod json_handler;
pub mod manager;
pub mod proto_handler;
pub mod tree_handler;

pub use checkpointer::{AsyncCheckpointer, HostMaterializer, Materializer};
pub use handler::{join_all, AsyncCheckpointHandler, CheckpointHandler, InFlightWork};
pub use json_handler::JsonCheckpointHandler;
pub use proto_handler::ProtoCheckpointHandler;
pub use manager::{CheckpointManager, CheckpointManagerConfig, STEP_METADATA_FILE};
pub use tree_handler::TreeCheckpointHandler;
