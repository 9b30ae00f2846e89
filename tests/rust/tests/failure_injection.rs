//! Failure injection and codec dispatch behavior.
//!
//! Wraps the local backend so specific writes fail, then checks that a
//! failed background phase never leaves a visible step behind, and that
//! the handler calls a codec once per same-tagged batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint::{CheckpointManager, CheckpointManagerConfig};
use checkpoint_core::{
    CheckpointTree, Error, LeafValue, ParamInfo, RestoreOptions, Result, SaveOptions, ValueCodec,
    ValueCodecRegistry,
};
use storage::{LocalStorage, StorageBackend};
use tempfile::TempDir;

/// Backend that fails writes whose path contains a marker once armed
struct FailingStorage {
    inner: LocalStorage,
    marker: &'static str,
    armed: AtomicBool,
}

impl FailingStorage {
    fn new(inner: LocalStorage, marker: &'static str) -> Self {
        Self {
            inner,
            marker,
            armed: AtomicBool::new(false),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for FailingStorage {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        if self.armed.load(Ordering::SeqCst) && path.contains(self.marker) {
            return Err(Error::Storage {
                message: format!("injected write failure at {}", path),
            });
        }
        self.inner.write(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to).await
    }

    async fn remove_prefix(&self, path: &str) -> Result<()> {
        self.inner.remove_prefix(path).await
    }

    async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_dirs(prefix).await
    }
}

fn tensor_tree(fill: u8) -> CheckpointTree {
    CheckpointTree::map([(
        "w".to_string(),
        CheckpointTree::leaf(LeafValue::Tensor(checkpoint_core::TensorData::new(
            checkpoint_core::DType::U8,
            vec![16],
            Bytes::from(vec![fill; 16]),
        ))),
    )])
}

#[tokio::test]
async fn test_failed_background_write_leaves_no_step() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let storage = Arc::new(FailingStorage::new(
        LocalStorage::new(temp.path()),
        "data-0.bin",
    ));
    let manager =
        CheckpointManager::new(CheckpointManagerConfig::default(), storage.clone()).await?;

    let items = HashMap::from([("state".to_string(), tensor_tree(1))]);
    manager.save(0, &items).await?;
    manager.wait_until_finished().await?;
    assert_eq!(manager.all_steps(), vec![0]);

    // Every data-file write fails from here on
    storage.arm();
    let items = HashMap::from([("state".to_string(), tensor_tree(2))]);
    assert!(manager.save(1, &items).await?);

    let err = manager.wait_until_finished().await.unwrap_err();
    assert!(matches!(err, Error::IncompleteWrite { step: 1, .. }));
    assert!(err.to_string().contains("state"));

    // The failed step never became visible, on disk or in the index
    assert_eq!(manager.all_steps(), vec![0]);
    assert!(!temp.path().join("1").exists());
    let leftovers: Vec<String> = std::fs::read_dir(temp.path())?
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty(), "temporaries left behind: {leftovers:?}");

    let err = manager
        .restore(1, None, &RestoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StepNotFound { step: 1 }));

    // The earlier step is untouched
    let restored = manager.restore(0, None, &RestoreOptions::default()).await?;
    assert_eq!(restored["state"], tensor_tree(1));
    Ok(())
}

#[tokio::test]
async fn test_failed_commit_write_cleans_temporary() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let storage = Arc::new(FailingStorage::new(
        LocalStorage::new(temp.path()),
        "_CHECKPOINT_METADATA",
    ));
    let manager =
        CheckpointManager::new(CheckpointManagerConfig::default(), storage.clone()).await?;

    // Item writes succeed; the step descriptor write at commit time fails
    storage.arm();
    let items = HashMap::from([("state".to_string(), tensor_tree(1))]);
    assert!(manager.save(0, &items).await?);

    let err = manager.wait_until_finished().await.unwrap_err();
    assert!(matches!(err, Error::IncompleteWrite { step: 0, .. }));

    assert_eq!(manager.all_steps(), Vec::<u64>::new());
    assert!(!temp.path().join("0").exists());
    let leftovers: Vec<String> = std::fs::read_dir(temp.path())?
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty(), "temporaries left behind: {leftovers:?}");
    Ok(())
}

/// Codec that counts how many times each batch entry point runs
struct CountingCodec {
    serialize_calls: Arc<AtomicUsize>,
    deserialize_calls: Arc<AtomicUsize>,
}

impl ValueCodec for CountingCodec {
    fn type_tag(&self) -> &str {
        "counted"
    }

    fn serialize_batch(
        &self,
        values: &[&LeafValue],
        infos: &[ParamInfo],
        _options: &SaveOptions,
    ) -> Result<Vec<Bytes>> {
        self.serialize_calls.fetch_add(1, Ordering::SeqCst);
        values
            .iter()
            .zip(infos)
            .map(|(value, info)| match value {
                LeafValue::Custom { data, .. } => Ok(data.clone()),
                other => Err(Error::Serialization(format!(
                    "leaf {} is not a counted value (tag {})",
                    info.name,
                    other.type_tag()
                ))),
            })
            .collect()
    }

    fn deserialize_batch(
        &self,
        blobs: &[Bytes],
        _infos: &[ParamInfo],
        _options: &RestoreOptions,
    ) -> Result<Vec<LeafValue>> {
        self.deserialize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(blobs
            .iter()
            .map(|b| LeafValue::Custom {
                tag: "counted".to_string(),
                data: b.clone(),
            })
            .collect())
    }
}

#[tokio::test]
async fn test_codec_called_once_per_batch() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let storage = Arc::new(LocalStorage::new(temp.path()));

    let serialize_calls = Arc::new(AtomicUsize::new(0));
    let deserialize_calls = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(ValueCodecRegistry::with_defaults());
    registry.register(
        Arc::new(CountingCodec {
            serialize_calls: serialize_calls.clone(),
            deserialize_calls: deserialize_calls.clone(),
        }),
        false,
    )?;

    let manager = CheckpointManager::with_handlers(
        CheckpointManagerConfig::default(),
        storage,
        registry,
        Vec::new(),
    )
    .await?;

    // Three leaves share the tag, one is a plain scalar
    let custom = |n: u8| {
        CheckpointTree::leaf(LeafValue::Custom {
            tag: "counted".to_string(),
            data: Bytes::from(vec![n; 8]),
        })
    };
    let tree = CheckpointTree::map([
        ("a".to_string(), custom(1)),
        ("b".to_string(), custom(2)),
        ("c".to_string(), custom(3)),
        (
            "step".to_string(),
            CheckpointTree::leaf(LeafValue::Scalar(checkpoint_core::Scalar::I64(0))),
        ),
    ]);
    let items = HashMap::from([("state".to_string(), tree.clone())]);
    manager.save(0, &items).await?;
    manager.wait_until_finished().await?;
    assert_eq!(serialize_calls.load(Ordering::SeqCst), 1);

    let restored = manager.restore(0, None, &RestoreOptions::default()).await?;
    assert_eq!(restored["state"], tree);
    assert_eq!(deserialize_calls.load(Ordering::SeqCst), 1);
    Ok(())
}
