//! Two-phase asynchronous checkpointer
//!
//! `save` blocks only while the item is materialized into a stable
//! snapshot and the writes are submitted. The writes themselves run in a
//! background task that finishes with an atomic rename of the temporary
//! directory, so a checkpoint directory is either complete or absent.

use std::sync::Arc;

use checkpoint_core::{CheckpointTree, Error, Result, RestoreOptions, SaveOptions, TreeMetadata};
use storage::StorageBackend;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::handler::{join_all, AsyncCheckpointHandler};

/// Snapshot source values into storage-owned buffers.
///
/// The snapshot must stay valid while background writes run; after
/// `materialize` returns, the caller is free to mutate the original.
pub trait Materializer: Send + Sync {
    fn materialize(&self, item: &CheckpointTree) -> Result<CheckpointTree>;
}

/// Deep-copies every leaf buffer on the calling thread
pub struct HostMaterializer;

impl Materializer for HostMaterializer {
    fn materialize(&self, item: &CheckpointTree) -> Result<CheckpointTree> {
        Ok(item.deep_copy())
    }
}

struct InFlightSave {
    directory: String,
    handle: JoinHandle<Result<()>>,
}

/// Orchestrates materialize, background write and atomic commit
pub struct AsyncCheckpointer {
    handler: Arc<dyn AsyncCheckpointHandler>,
    storage: Arc<dyn StorageBackend>,
    materializer: Arc<dyn Materializer>,
    in_flight: Mutex<Option<InFlightSave>>,
}

impl AsyncCheckpointer {
    pub fn new(handler: Arc<dyn AsyncCheckpointHandler>, storage: Arc<dyn StorageBackend>) -> Self {
        Self::with_materializer(handler, storage, Arc::new(HostMaterializer))
    }

    pub fn with_materializer(
        handler: Arc<dyn AsyncCheckpointHandler>,
        storage: Arc<dyn StorageBackend>,
        materializer: Arc<dyn Materializer>,
    ) -> Self {
        Self {
            handler,
            storage,
            materializer,
            in_flight: Mutex::new(None),
        }
    }

    /// Start saving `item` to `directory`.
    ///
    /// Blocks until the snapshot is taken and the writes are submitted,
    /// then returns while they complete in the background. At most one
    /// save is in flight; a second call drains the previous one first.
    #[instrument(skip(self, item, options), fields(directory = %directory))]
    pub async fn save(
        &self,
        directory: &str,
        item: &CheckpointTree,
        options: &SaveOptions,
    ) -> Result<()> {
        self.wait_until_finished().await?;

        if self.storage.exists(directory).await? {
            if options.force_overwrite {
                debug!(directory = %directory, "Overwriting existing checkpoint");
                self.storage.remove_prefix(directory).await?;
            } else {
                return Err(Error::DirectoryConflict {
                    path: directory.to_string(),
                });
            }
        }

        // Phase 1: snapshot and submit. Failures here surface directly.
        let snapshot = self.materializer.materialize(item)?;
        let tmp_dir = format!("{}.tmp-{}", directory, Uuid::new_v4());
        let works = self.handler.async_save(&tmp_dir, &snapshot, options).await?;

        // Phase 2: drain writes, then commit with a single rename
        let storage = self.storage.clone();
        let final_dir = directory.to_string();
        let tmp = tmp_dir.clone();
        let handle = tokio::spawn(async move {
            match join_all(works).await {
                Ok(()) => {
                    storage.rename(&tmp, &final_dir).await?;
                    info!(directory = %final_dir, "Checkpoint committed");
                    Ok(())
                }
                Err(e) => {
                    if let Err(cleanup) = storage.remove_prefix(&tmp).await {
                        warn!(directory = %tmp, error = %cleanup, "Failed to remove temporary checkpoint directory");
                    }
                    Err(e)
                }
            }
        });

        let mut in_flight = self.in_flight.lock().await;
        *in_flight = Some(InFlightSave {
            directory: directory.to_string(),
            handle,
        });
        Ok(())
    }

    /// Block until the in-flight save, if any, has committed or failed.
    /// Idempotent; a failure is reported once.
    pub async fn wait_until_finished(&self) -> Result<()> {
        let pending = self.in_flight.lock().await.take();
        let Some(save) = pending else {
            return Ok(());
        };
        match save.handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal {
                message: format!(
                    "background save of {} panicked: {}",
                    save.directory, e
                ),
            }),
        }
    }

    /// Directory of the save currently in flight, if any
    pub async fn in_flight_directory(&self) -> Option<String> {
        self.in_flight
            .lock()
            .await
            .as_ref()
            .map(|s| s.directory.clone())
    }

    pub async fn restore(
        &self,
        directory: &str,
        options: &RestoreOptions,
    ) -> Result<CheckpointTree> {
        self.handler.restore(directory, options).await
    }

    pub async fn metadata(&self, directory: &str) -> Result<TreeMetadata> {
        self.handler.metadata(directory).await
    }

    /// Drain outstanding work before dropping the checkpointer
    pub async fn close(&self) -> Result<()> {
        self.wait_until_finished().await
    }
}
