//! End-to-end manager lifecycle: a training loop saving on an interval,
//! retention, crash recovery, and restart behavior.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use checkpoint::{CheckpointManager, CheckpointManagerConfig, JsonCheckpointHandler};
use checkpoint_core::{
    CheckpointTree, DType, LeafValue, RestoreOptions, Scalar, StorageLayout, TensorData,
};
use storage::LocalStorage;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn model_state(step: u64) -> CheckpointTree {
    let fill = (step % 251) as u8;
    CheckpointTree::map([
        (
            "params".to_string(),
            CheckpointTree::map([
                (
                    "kernel".to_string(),
                    CheckpointTree::leaf(LeafValue::Tensor(TensorData::new(
                        DType::F32,
                        vec![8, 4],
                        Bytes::from(vec![fill; 128]),
                    ))),
                ),
                (
                    "bias".to_string(),
                    CheckpointTree::leaf(LeafValue::Tensor(TensorData::new(
                        DType::F32,
                        vec![4],
                        Bytes::from(vec![fill.wrapping_add(1); 16]),
                    ))),
                ),
            ]),
        ),
        (
            "opt_state".to_string(),
            CheckpointTree::List(vec![
                CheckpointTree::leaf(LeafValue::Tensor(TensorData::new(
                    DType::F32,
                    vec![8, 4],
                    Bytes::from(vec![fill.wrapping_add(2); 128]),
                ))),
                CheckpointTree::leaf(LeafValue::Scalar(Scalar::F64(0.9))),
            ]),
        ),
        (
            "step".to_string(),
            CheckpointTree::leaf(LeafValue::Scalar(Scalar::I64(step as i64))),
        ),
    ])
}

fn step_items(step: u64) -> HashMap<String, CheckpointTree> {
    HashMap::from([("state".to_string(), model_state(step))])
}

#[tokio::test]
async fn test_training_loop_interval_and_retention() -> anyhow::Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let storage = Arc::new(LocalStorage::new(temp.path()));
    let config = CheckpointManagerConfig {
        save_interval_steps: 2,
        max_to_keep: Some(3),
        ..Default::default()
    };
    let manager = CheckpointManager::new(config, storage).await?;

    let mut saved = Vec::new();
    for step in 0..=10 {
        if manager.save(step, &step_items(step)).await? {
            saved.push(step);
        }
    }
    manager.close().await?;

    assert_eq!(saved, vec![0, 2, 4, 6, 8, 10]);
    assert_eq!(manager.all_steps(), vec![6, 8, 10]);
    assert_eq!(manager.latest_step(), Some(10));

    // Retained steps restore with the values they were saved with
    let restored = manager.restore(8, None, &RestoreOptions::default()).await?;
    assert_eq!(restored["state"], model_state(8));

    // Deleted steps are gone from disk too
    assert!(!temp.path().join("4").exists());
    Ok(())
}

#[tokio::test]
async fn test_back_to_back_saves_serialize() -> anyhow::Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let storage = Arc::new(LocalStorage::new(temp.path()));
    let manager =
        CheckpointManager::new(CheckpointManagerConfig::default(), storage).await?;

    // No explicit wait between saves; each save drains its predecessor
    for step in 0..5 {
        assert!(manager.save(step, &step_items(step)).await?);
    }
    manager.wait_until_finished().await?;
    assert_eq!(manager.all_steps(), vec![0, 1, 2, 3, 4]);

    let restored = manager.restore(3, None, &RestoreOptions::default()).await?;
    assert_eq!(restored["state"], model_state(3));
    Ok(())
}

#[tokio::test]
async fn test_restart_recovers_committed_steps() -> anyhow::Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let storage = Arc::new(LocalStorage::new(temp.path()));
    let config = CheckpointManagerConfig {
        save_interval_steps: 2,
        ..Default::default()
    };

    {
        let manager = CheckpointManager::new(config.clone(), storage.clone()).await?;
        manager.save(4, &step_items(4)).await?;
        manager.close().await?;
    }

    // Fresh process over the same root
    let manager = CheckpointManager::new(config, storage).await?;
    assert_eq!(manager.all_steps(), vec![4]);
    assert_eq!(manager.latest_step(), Some(4));

    // The interval counts from the recovered step
    assert!(!manager.should_save(4));
    assert!(!manager.should_save(5));
    assert!(manager.should_save(6));

    let restored = manager.restore(4, None, &RestoreOptions::default()).await?;
    assert_eq!(restored["state"], model_state(4));
    Ok(())
}

#[tokio::test]
async fn test_restart_removes_abandoned_temporaries() -> anyhow::Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let storage = Arc::new(LocalStorage::new(temp.path()));

    {
        let manager =
            CheckpointManager::new(CheckpointManagerConfig::default(), storage.clone()).await?;
        manager.save(5, &step_items(5)).await?;
        manager.close().await?;
    }

    // Simulate a crash that left a half-written step behind
    let abandoned = temp.path().join("7.tmp-deadbeef");
    std::fs::create_dir_all(abandoned.join("state"))?;
    std::fs::write(abandoned.join("state").join("data-0.bin"), b"partial")?;

    let manager = CheckpointManager::new(CheckpointManagerConfig::default(), storage).await?;
    assert_eq!(manager.all_steps(), vec![5]);
    assert!(!abandoned.exists());
    Ok(())
}

#[tokio::test]
async fn test_legacy_layout_round_trips_through_manager() -> anyhow::Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let storage = Arc::new(LocalStorage::new(temp.path()));
    let config = CheckpointManagerConfig {
        layout: StorageLayout::Legacy,
        ..Default::default()
    };
    let manager = CheckpointManager::new(config, storage).await?;

    manager.save(0, &step_items(0)).await?;
    manager.wait_until_finished().await?;

    // One directory per leaf, no manifest
    assert!(temp.path().join("0/state/params/kernel/value.bin").exists());
    assert!(!temp.path().join("0/state/manifest.json").exists());

    let restored = manager.restore(0, None, &RestoreOptions::default()).await?;
    assert_eq!(restored["state"], model_state(0));
    Ok(())
}

#[tokio::test]
async fn test_per_item_handler_override() -> anyhow::Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let storage = Arc::new(LocalStorage::new(temp.path()));
    let json_handler = Arc::new(JsonCheckpointHandler::new(storage.clone()));
    let manager = CheckpointManager::with_handlers(
        CheckpointManagerConfig::default(),
        storage,
        Arc::new(checkpoint_core::ValueCodecRegistry::with_defaults()),
        [(
            "run_info".to_string(),
            json_handler as Arc<dyn checkpoint::AsyncCheckpointHandler>,
        )],
    )
    .await?;

    let run_info = CheckpointTree::map([
        (
            "experiment".to_string(),
            CheckpointTree::leaf(LeafValue::Str("warmup-sweep".to_string())),
        ),
        (
            "seed".to_string(),
            CheckpointTree::leaf(LeafValue::Scalar(Scalar::I64(1234))),
        ),
    ]);
    let items = HashMap::from([
        ("state".to_string(), model_state(0)),
        ("run_info".to_string(), run_info.clone()),
    ]);
    manager.save(0, &items).await?;
    manager.wait_until_finished().await?;

    // The JSON item is a plain readable document on disk
    let raw = std::fs::read_to_string(temp.path().join("0/run_info/metadata"))?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    assert_eq!(parsed["experiment"], "warmup-sweep");

    let names = vec!["run_info".to_string()];
    let restored = manager
        .restore(0, Some(&names), &RestoreOptions::default())
        .await?;
    assert_eq!(restored["run_info"], run_info);
    assert!(!restored.contains_key("state"));
    Ok(())
}

#[tokio::test]
async fn test_skipped_step_writes_nothing() -> anyhow::Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let storage = Arc::new(LocalStorage::new(temp.path()));
    let config = CheckpointManagerConfig {
        save_interval_steps: 10,
        ..Default::default()
    };
    let manager = CheckpointManager::new(config, storage).await?;

    assert!(!manager.save(3, &step_items(3)).await?);
    manager.close().await?;
    assert_eq!(manager.all_steps(), Vec::<u64>::new());
    assert_eq!(std::fs::read_dir(temp.path())?.count(), 0);
    Ok(())
}
