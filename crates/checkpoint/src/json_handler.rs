//! JSON checkpoint handler
//!
//! Persists a scalar-only tree as a single pretty-printed JSON file.
//! Suited for run metadata and small configs that should stay readable
//! with standard tools. Tensor, bytes and custom leaves are rejected.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_core::{
    CheckpointTree, Error, LeafMetadata, LeafValue, Result, RestoreOptions, SaveOptions, Scalar,
    TreeMetadata,
};
use serde_json::Value;
use storage::StorageBackend;

use crate::handler::{AsyncCheckpointHandler, CheckpointHandler, InFlightWork};

/// Default file name inside the checkpoint directory
pub const DEFAULT_JSON_FILENAME: &str = "metadata";

/// Handler that writes one JSON document per checkpoint
pub struct JsonCheckpointHandler {
    storage: Arc<dyn StorageBackend>,
    filename: String,
}

impl JsonCheckpointHandler {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            filename: DEFAULT_JSON_FILENAME.to_string(),
        }
    }

    /// Override the file name inside the checkpoint directory
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    fn file_path(&self, directory: &str) -> String {
        format!("{}/{}", directory, self.filename)
    }

    fn encode(&self, item: &CheckpointTree) -> Result<Bytes> {
        let value = tree_to_json(item, "")?;
        let mut text = serde_json::to_vec_pretty(&value)?;
        text.push(b'\n');
        Ok(Bytes::from(text))
    }

    async fn read_value(&self, directory: &str) -> Result<Value> {
        let raw = self.storage.read(&self.file_path(directory)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl CheckpointHandler for JsonCheckpointHandler {
    async fn save(
        &self,
        directory: &str,
        item: &CheckpointTree,
        _options: &SaveOptions,
    ) -> Result<()> {
        let encoded = self.encode(item)?;
        self.storage.write(&self.file_path(directory), encoded).await?;
        Ok(())
    }

    /// The restore template is not consulted; the saved structure is
    /// returned as written.
    async fn restore(&self, directory: &str, _options: &RestoreOptions) -> Result<CheckpointTree> {
        let value = self.read_value(directory).await?;
        json_to_tree(&value, "")
    }

    async fn metadata(&self, directory: &str) -> Result<TreeMetadata> {
        let value = self.read_value(directory).await?;
        let tree = json_to_tree(&value, "")?;
        let leaves = tree
            .flatten()
            .into_iter()
            .map(|(path, leaf)| {
                (
                    path,
                    LeafMetadata {
                        type_tag: leaf.type_tag().to_string(),
                        dtype: None,
                        shape: None,
                        size_bytes: leaf.size_bytes(),
                    },
                )
            })
            .collect();
        Ok(TreeMetadata { leaves })
    }
}

#[async_trait]
impl AsyncCheckpointHandler for JsonCheckpointHandler {
    async fn async_save(
        &self,
        directory: &str,
        item: &CheckpointTree,
        _options: &SaveOptions,
    ) -> Result<Vec<InFlightWork>> {
        let encoded = self.encode(item)?;
        let storage = self.storage.clone();
        let path = self.file_path(directory);
        let work = InFlightWork::spawn(self.filename.clone(), async move {
            storage.write(&path, encoded).await.map(|_| ())
        });
        Ok(vec![work])
    }
}

fn tree_to_json(tree: &CheckpointTree, path: &str) -> Result<Value> {
    match tree {
        CheckpointTree::Map(m) => {
            let mut out = serde_json::Map::with_capacity(m.len());
            for (key, child) in m {
                let child_path = checkpoint_core::join_path(path, key);
                out.insert(key.clone(), tree_to_json(child, &child_path)?);
            }
            Ok(Value::Object(out))
        }
        CheckpointTree::List(l) => {
            let mut out = Vec::with_capacity(l.len());
            for (i, child) in l.iter().enumerate() {
                let child_path = checkpoint_core::join_path(path, &i.to_string());
                out.push(tree_to_json(child, &child_path)?);
            }
            Ok(Value::Array(out))
        }
        CheckpointTree::Leaf(leaf) => match leaf {
            LeafValue::Scalar(Scalar::I64(v)) => Ok(Value::from(*v)),
            LeafValue::Scalar(Scalar::F64(v)) => {
                serde_json::Number::from_f64(*v).map(Value::Number).ok_or_else(|| {
                    Error::StructureMismatch {
                        path: path.to_string(),
                        reason: "non-finite float is not representable in JSON".to_string(),
                    }
                })
            }
            LeafValue::Scalar(Scalar::Bool(v)) => Ok(Value::Bool(*v)),
            LeafValue::Str(s) => Ok(Value::String(s.clone())),
            other => Err(Error::StructureMismatch {
                path: path.to_string(),
                reason: format!(
                    "leaf type {} cannot be written as JSON",
                    other.type_tag()
                ),
            }),
        },
    }
}

fn json_to_tree(value: &Value, path: &str) -> Result<CheckpointTree> {
    match value {
        Value::Object(m) => {
            let mut out = BTreeMap::new();
            for (key, child) in m {
                let child_path = checkpoint_core::join_path(path, key);
                out.insert(key.clone(), json_to_tree(child, &child_path)?);
            }
            Ok(CheckpointTree::Map(out))
        }
        Value::Array(l) => {
            let mut out = Vec::with_capacity(l.len());
            for (i, child) in l.iter().enumerate() {
                let child_path = checkpoint_core::join_path(path, &i.to_string());
                out.push(json_to_tree(child, &child_path)?);
            }
            Ok(CheckpointTree::List(out))
        }
        Value::Bool(v) => Ok(CheckpointTree::leaf(LeafValue::Scalar(Scalar::Bool(*v)))),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(CheckpointTree::leaf(LeafValue::Scalar(Scalar::I64(v))))
            } else if n.is_u64() {
                // Restoring through f64 would silently lose precision
                Err(Error::StructureMismatch {
                    path: path.to_string(),
                    reason: format!("integer {} does not fit i64", n),
                })
            } else if let Some(v) = n.as_f64() {
                Ok(CheckpointTree::leaf(LeafValue::Scalar(Scalar::F64(v))))
            } else {
                Err(Error::StructureMismatch {
                    path: path.to_string(),
                    reason: format!("number {} does not fit i64 or f64", n),
                })
            }
        }
        Value::String(s) => Ok(CheckpointTree::leaf(LeafValue::Str(s.clone()))),
        Value::Null => Err(Error::StructureMismatch {
            path: path.to_string(),
            reason: "null has no leaf representation".to_string(),
        }),
    }
}
