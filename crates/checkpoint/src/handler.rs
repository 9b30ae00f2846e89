//! Checkpoint handler contract and in-flight background work
//!
//! A handler owns the persistence of one checkpointable object into one
//! directory. The async variant additionally exposes a non-blocking save
//! that returns handles to write work already running in the background.

use async_trait::async_trait;
use checkpoint_core::{
    CheckpointTree, Error, Result, RestoreOptions, SaveOptions, TreeMetadata,
};
use tracing::{debug, error};

/// Handle to one background write already running; awaited later
///
/// The set of handles returned by one `async_save` call is owned
/// exclusively by the orchestrator that triggered it until joined.
#[derive(Debug)]
pub struct InFlightWork {
    label: String,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl InFlightWork {
    /// Spawn a unit of background write work under a label used in
    /// failure reports
    pub fn spawn<F>(label: impl Into<String>, fut: F) -> Self
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            handle: tokio::spawn(fut),
        }
    }

    /// Label identifying the unit of work
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wait for the work to finish, annotating failures with the label
    pub async fn join(self) -> Result<()> {
        match self.handle.await {
            Ok(Ok(())) => {
                debug!(label = %self.label, "Background write completed");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(label = %self.label, error = %e, "Background write failed");
                Err(Error::CheckpointWriteFailed {
                    message: format!("{}: {}", self.label, e),
                })
            }
            Err(e) => Err(Error::Internal {
                message: format!("background write {} panicked: {}", self.label, e),
            }),
        }
    }
}

/// Join a whole batch of in-flight work, reporting every failed unit in
/// one aggregate error rather than stopping at the first
pub async fn join_all(works: Vec<InFlightWork>) -> Result<()> {
    let mut failures = Vec::new();
    for work in works {
        if let Err(e) = work.join().await {
            failures.push(e.to_string());
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::CheckpointWriteFailed {
            message: failures.join("; "),
        })
    }
}

/// Blocking per-object persistence contract
///
/// `save` must leave the directory either fully populated or (on failure)
/// absent, never partially populated and visible.
#[async_trait]
pub trait CheckpointHandler: Send + Sync {
    /// Persist `item` into `directory`, blocking until done
    async fn save(
        &self,
        directory: &str,
        item: &CheckpointTree,
        options: &SaveOptions,
    ) -> Result<()>;

    /// Reconstruct the saved value, honoring `options.template` when given
    async fn restore(&self, directory: &str, options: &RestoreOptions) -> Result<CheckpointTree>;

    /// Restore-cheap descriptor of the saved value
    async fn metadata(&self, directory: &str) -> Result<TreeMetadata>;
}

/// Handler variant with a non-blocking save
#[async_trait]
pub trait AsyncCheckpointHandler: CheckpointHandler {
    /// Start persisting `item` into `directory`; the returned work is
    /// already running. The call itself may perform a short blocking
    /// prelude (encoding) before submission.
    async fn async_save(
        &self,
        directory: &str,
        item: &CheckpointTree,
        options: &SaveOptions,
    ) -> Result<Vec<InFlightWork>>;
}
