//! Step-indexed checkpoint manager
//!
//! Owns a root directory of numbered step directories, one per saved
//! generation. Decides when a step is worth saving, fans a step out to
//! per-item checkpointers, commits the whole step with one directory
//! rename, enforces retention, and cleans up temporaries abandoned by a
//! crashed predecessor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use checkpoint_core::{
    CheckpointTree, Error, Result, RestoreOptions, SaveOptions, Step, StepMetadata, StepRecord,
    StepStatus, StorageLayout, TreeMetadata, ValueCodecRegistry,
};
use parking_lot::RwLock;
use storage::aggregate::DEFAULT_LARGE_LEAF_THRESHOLD;
use storage::StorageBackend;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::checkpointer::AsyncCheckpointer;
use crate::handler::AsyncCheckpointHandler;
use crate::tree_handler::TreeCheckpointHandler;

/// Per-step descriptor written into the step directory before commit
pub const STEP_METADATA_FILE: &str = "_CHECKPOINT_METADATA";

/// Manager configuration
#[derive(Debug, Clone)]
pub struct CheckpointManagerConfig {
    /// Directory under the storage backend holding the step directories.
    /// Empty means the backend root itself.
    pub root: String,

    /// Committed steps to retain; `None` keeps everything
    pub max_to_keep: Option<usize>,

    /// Save every N-th step counted from the last saved step
    pub save_interval_steps: u64,

    /// Layout new checkpoints are written in
    pub layout: StorageLayout,

    /// Size above which a leaf gets a dedicated data file
    pub large_leaf_threshold: usize,
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        Self {
            root: String::new(),
            max_to_keep: Some(5),
            save_interval_steps: 1,
            layout: StorageLayout::default(),
            large_leaf_threshold: DEFAULT_LARGE_LEAF_THRESHOLD,
        }
    }
}

impl CheckpointManagerConfig {
    fn validate(&self) -> Result<()> {
        if self.save_interval_steps == 0 {
            return Err(Error::InvalidConfig {
                message: "save_interval_steps must be at least 1".to_string(),
            });
        }
        if self.max_to_keep == Some(0) {
            return Err(Error::InvalidConfig {
                message: "max_to_keep must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct SaveTracker {
    last_attempted: Option<Step>,
    last_saved: Option<Step>,
}

struct PendingStep {
    step: Step,
    final_dir: String,
    tmp_dir: String,
    items: Vec<String>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Manages a directory of step checkpoints
pub struct CheckpointManager {
    config: CheckpointManagerConfig,
    storage: Arc<dyn StorageBackend>,
    default_handler: Arc<dyn AsyncCheckpointHandler>,
    item_handlers: HashMap<String, Arc<dyn AsyncCheckpointHandler>>,
    checkpointers: RwLock<HashMap<String, Arc<AsyncCheckpointer>>>,
    steps: RwLock<BTreeMap<Step, StepRecord>>,
    pending: Mutex<Option<PendingStep>>,
    restoring: RwLock<HashSet<Step>>,
    tracker: RwLock<SaveTracker>,
}

impl CheckpointManager {
    /// Open a manager over `config.root` with the built-in codecs and the
    /// tree handler for every item
    pub async fn new(
        config: CheckpointManagerConfig,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        Self::with_handlers(
            config,
            storage,
            Arc::new(ValueCodecRegistry::with_defaults()),
            Vec::new(),
        )
        .await
    }

    /// Open a manager with a caller-supplied codec registry and per-item
    /// handler overrides. Items without an override use the tree handler.
    pub async fn with_handlers(
        config: CheckpointManagerConfig,
        storage: Arc<dyn StorageBackend>,
        registry: Arc<ValueCodecRegistry>,
        handlers: impl IntoIterator<Item = (String, Arc<dyn AsyncCheckpointHandler>)>,
    ) -> Result<Self> {
        config.validate()?;

        let default_handler = Arc::new(
            TreeCheckpointHandler::new(storage.clone(), registry)
                .with_large_leaf_threshold(config.large_leaf_threshold),
        );
        let mut manager = Self {
            config,
            storage,
            default_handler,
            item_handlers: handlers.into_iter().collect(),
            checkpointers: RwLock::new(HashMap::new()),
            steps: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(None),
            restoring: RwLock::new(HashSet::new()),
            tracker: RwLock::new(SaveTracker::default()),
        };
        manager.recover().await?;
        Ok(manager)
    }

    /// Scan the root directory: delete abandoned temporaries, index every
    /// committed step, and seed the save tracker from the newest one
    async fn recover(&mut self) -> Result<()> {
        if !self.storage.exists(&self.config.root).await? {
            return Ok(());
        }
        let names = self.storage.list_dirs(&self.config.root).await?;
        for name in names {
            let path = self.root_join(&name);
            if name.contains(".tmp-") {
                warn!(directory = %path, "Removing abandoned temporary checkpoint directory");
                self.storage.remove_prefix(&path).await?;
                continue;
            }
            let Ok(step) = name.parse::<Step>() else {
                debug!(directory = %path, "Skipping non-step directory");
                continue;
            };
            let (items, created_at) = self.read_step_metadata(&path).await;
            self.steps.get_mut().insert(
                step,
                StepRecord {
                    step,
                    path,
                    items,
                    status: StepStatus::Committed,
                    created_at,
                },
            );
        }

        let latest = self.steps.get_mut().keys().next_back().copied();
        if let Some(step) = latest {
            info!(step, "Recovered committed checkpoints");
            let tracker = self.tracker.get_mut();
            tracker.last_attempted = Some(step);
            tracker.last_saved = Some(step);
        }
        Ok(())
    }

    /// Step descriptor, or an item listing for directories committed
    /// without one
    async fn read_step_metadata(&self, dir: &str) -> (Vec<String>, DateTime<Utc>) {
        let meta_path = format!("{}/{}", dir, STEP_METADATA_FILE);
        match self.storage.read(&meta_path).await {
            Ok(raw) => match serde_json::from_slice::<StepMetadata>(&raw) {
                Ok(meta) => return (meta.items, meta.created_at),
                Err(e) => {
                    warn!(directory = %dir, error = %e, "Unreadable step descriptor, falling back to a directory listing");
                }
            },
            Err(Error::StoragePathNotFound { .. }) => {}
            Err(e) => {
                warn!(directory = %dir, error = %e, "Failed to read step descriptor, falling back to a directory listing");
            }
        }
        let items = self.storage.list_dirs(dir).await.unwrap_or_default();
        (items, Utc::now())
    }

    fn root_join(&self, name: &str) -> String {
        if self.config.root.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.config.root, name)
        }
    }

    fn step_dir(&self, step: Step) -> String {
        self.root_join(&step.to_string())
    }

    fn checkpointer_for(&self, item: &str) -> Arc<AsyncCheckpointer> {
        if let Some(cp) = self.checkpointers.read().get(item) {
            return cp.clone();
        }
        let handler = self
            .item_handlers
            .get(item)
            .cloned()
            .unwrap_or_else(|| self.default_handler.clone());
        let cp = Arc::new(AsyncCheckpointer::new(handler, self.storage.clone()));
        self.checkpointers
            .write()
            .entry(item.to_string())
            .or_insert(cp)
            .clone()
    }

    /// Whether `step` is due under the save interval.
    ///
    /// A step already attempted is never due again. Otherwise a step is
    /// due when its distance from the last saved step is a multiple of
    /// the interval; with nothing saved yet, distance counts from zero.
    pub fn should_save(&self, step: Step) -> bool {
        let tracker = self.tracker.read();
        if let Some(last) = tracker.last_attempted {
            if step <= last {
                return false;
            }
        }
        let base = tracker.last_saved.unwrap_or(0);
        step >= base && (step - base) % self.config.save_interval_steps == 0
    }

    /// Save `items` as step `step` if the interval makes it due.
    ///
    /// Returns `Ok(false)` without touching storage when the step is not
    /// due. Blocks until the snapshot is taken and writes are submitted;
    /// the step commits in the background and becomes visible after the
    /// next [`wait_until_finished`](Self::wait_until_finished).
    pub async fn save(
        &self,
        step: Step,
        items: &HashMap<String, CheckpointTree>,
    ) -> Result<bool> {
        let options = SaveOptions {
            layout: self.config.layout,
            ..Default::default()
        };
        self.save_with_options(step, items, &options).await
    }

    /// As [`save`](Self::save), with explicit options.
    /// `force_overwrite` also bypasses the save-interval rule.
    #[instrument(skip(self, items, options))]
    pub async fn save_with_options(
        &self,
        step: Step,
        items: &HashMap<String, CheckpointTree>,
        options: &SaveOptions,
    ) -> Result<bool> {
        if !options.force_overwrite && !self.should_save(step) {
            debug!(step, "Step not due under the save interval, skipping");
            return Ok(false);
        }
        self.wait_until_finished().await?;

        let final_dir = self.step_dir(step);
        if self.storage.exists(&final_dir).await? {
            if options.force_overwrite {
                self.storage.remove_prefix(&final_dir).await?;
                if let Some(record) = self.steps.write().get_mut(&step) {
                    record.status = StepStatus::Deleted;
                }
            } else {
                return Err(Error::DirectoryConflict { path: final_dir });
            }
        }

        let tmp_dir = format!("{}.tmp-{}", final_dir, Uuid::new_v4());
        let mut names: Vec<String> = items.keys().cloned().collect();
        names.sort();

        let mut launched: Vec<Arc<AsyncCheckpointer>> = Vec::new();
        for name in &names {
            let cp = self.checkpointer_for(name);
            let item_dir = format!("{}/{}", tmp_dir, name);
            if let Err(e) = cp.save(&item_dir, &items[name], options).await {
                // Snapshot or submission failed. Drain what already
                // launched, drop the temporary directory, surface the
                // failure synchronously.
                for cp in launched {
                    if let Err(drain) = cp.wait_until_finished().await {
                        warn!(step, error = %drain, "Item write failed while aborting step");
                    }
                }
                if let Err(cleanup) = self.storage.remove_prefix(&tmp_dir).await {
                    warn!(directory = %tmp_dir, error = %cleanup, "Failed to remove temporary step directory");
                }
                return Err(e);
            }
            launched.push(cp);
        }

        self.tracker.write().last_attempted = Some(step);
        *self.pending.lock().await = Some(PendingStep {
            step,
            final_dir,
            tmp_dir,
            items: names,
            created_at: Utc::now(),
        });
        debug!(step, "Step writes submitted");
        Ok(true)
    }

    /// Block until the pending step, if any, commits or fails.
    ///
    /// On success the step directory is promoted with a single rename and
    /// the step becomes restorable. On failure the temporary directory is
    /// removed and `IncompleteWrite` reports every failed item.
    pub async fn wait_until_finished(&self) -> Result<()> {
        let pending = self.pending.lock().await.take();
        let Some(p) = pending else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for name in &p.items {
            let cp = self.checkpointer_for(name);
            if let Err(e) = cp.wait_until_finished().await {
                failures.push(format!("{}: {}", name, e));
            }
        }
        if !failures.is_empty() {
            if let Err(cleanup) = self.storage.remove_prefix(&p.tmp_dir).await {
                warn!(directory = %p.tmp_dir, error = %cleanup, "Failed to remove temporary step directory");
            }
            return Err(Error::IncompleteWrite {
                step: p.step,
                message: failures.join("; "),
            });
        }

        if let Err(e) = self.promote(&p).await {
            if let Err(cleanup) = self.storage.remove_prefix(&p.tmp_dir).await {
                warn!(directory = %p.tmp_dir, error = %cleanup, "Failed to remove temporary step directory");
            }
            return Err(Error::IncompleteWrite {
                step: p.step,
                message: format!("commit failed: {}", e),
            });
        }

        self.steps.write().insert(
            p.step,
            StepRecord {
                step: p.step,
                path: p.final_dir,
                items: p.items,
                status: StepStatus::Committed,
                created_at: p.created_at,
            },
        );
        self.tracker.write().last_saved = Some(p.step);
        info!(step = p.step, "Checkpoint step committed");

        self.enforce_retention().await;
        Ok(())
    }

    /// Write the step descriptor into the temporary directory and promote
    /// it with the single atomic rename
    async fn promote(&self, p: &PendingStep) -> Result<()> {
        let meta = StepMetadata {
            step: p.step,
            items: p.items.clone(),
            created_at: p.created_at,
        };
        let meta_path = format!("{}/{}", p.tmp_dir, STEP_METADATA_FILE);
        self.storage
            .write(&meta_path, Bytes::from(serde_json::to_vec_pretty(&meta)?))
            .await?;
        self.storage.rename(&p.tmp_dir, &p.final_dir).await
    }

    /// Delete the oldest committed steps beyond `max_to_keep`. Steps with
    /// a restore in progress are spared until the next pass.
    async fn enforce_retention(&self) {
        let Some(keep) = self.config.max_to_keep else {
            return;
        };
        loop {
            let candidate = {
                let steps = self.steps.read();
                let committed: Vec<Step> = steps
                    .values()
                    .filter(|r| r.status == StepStatus::Committed)
                    .map(|r| r.step)
                    .collect();
                if committed.len() <= keep {
                    return;
                }
                let restoring = self.restoring.read();
                committed.into_iter().find(|s| !restoring.contains(s))
            };
            let Some(step) = candidate else {
                return;
            };
            let path = self.step_dir(step);
            match self.storage.remove_prefix(&path).await {
                Ok(()) => {
                    if let Some(record) = self.steps.write().get_mut(&step) {
                        record.status = StepStatus::Deleted;
                    }
                    debug!(step, "Deleted checkpoint under retention");
                }
                Err(e) => {
                    warn!(step, error = %e, "Failed to delete checkpoint under retention");
                    return;
                }
            }
        }
    }

    /// Committed steps in ascending order
    pub fn all_steps(&self) -> Vec<Step> {
        self.steps
            .read()
            .values()
            .filter(|r| r.status == StepStatus::Committed)
            .map(|r| r.step)
            .collect()
    }

    /// Newest committed step
    pub fn latest_step(&self) -> Option<Step> {
        self.all_steps().into_iter().next_back()
    }

    /// Restore items of a committed step.
    ///
    /// `items` selects a subset by name; `None` restores everything the
    /// step contains. While the restore runs the step is exempt from
    /// retention deletion.
    #[instrument(skip(self, items, options))]
    pub async fn restore(
        &self,
        step: Step,
        items: Option<&[String]>,
        options: &RestoreOptions,
    ) -> Result<HashMap<String, CheckpointTree>> {
        let record = self
            .steps
            .read()
            .get(&step)
            .filter(|r| r.status == StepStatus::Committed)
            .cloned()
            .ok_or(Error::StepNotFound { step })?;

        let names: Vec<String> = match items {
            Some(requested) => {
                for name in requested {
                    if !record.items.contains(name) {
                        return Err(Error::StructureMismatch {
                            path: name.clone(),
                            reason: format!("step {} has no item by this name", step),
                        });
                    }
                }
                requested.to_vec()
            }
            None => record.items.clone(),
        };

        self.restoring.write().insert(step);
        let result = self.restore_items(&record, &names, options).await;
        self.restoring.write().remove(&step);
        result
    }

    async fn restore_items(
        &self,
        record: &StepRecord,
        names: &[String],
        options: &RestoreOptions,
    ) -> Result<HashMap<String, CheckpointTree>> {
        let mut out = HashMap::with_capacity(names.len());
        for name in names {
            let cp = self.checkpointer_for(name);
            let dir = format!("{}/{}", record.path, name);
            out.insert(name.clone(), cp.restore(&dir, options).await?);
        }
        Ok(out)
    }

    /// Leaf descriptors of one item of a committed step, without reading
    /// its payloads
    pub async fn item_metadata(&self, step: Step, item: &str) -> Result<TreeMetadata> {
        let record = self
            .steps
            .read()
            .get(&step)
            .filter(|r| r.status == StepStatus::Committed)
            .cloned()
            .ok_or(Error::StepNotFound { step })?;
        if !record.items.contains(&item.to_string()) {
            return Err(Error::StructureMismatch {
                path: item.to_string(),
                reason: format!("step {} has no item by this name", step),
            });
        }
        let cp = self.checkpointer_for(item);
        cp.metadata(&format!("{}/{}", record.path, item)).await
    }

    /// Drain the pending step before shutdown
    pub async fn close(&self) -> Result<()> {
        self.wait_until_finished().await
    }
}
