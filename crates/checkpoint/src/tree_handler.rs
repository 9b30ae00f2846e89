//! Structured-tree checkpoint handler
//!
//! Flattens a checkpointable tree, dispatches leaves to their codecs in
//! per-type batches, and writes either the aggregated or the legacy
//! layout. Restore re-drives the same dispatch from the persisted type
//! tags, honoring an optional target template.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_core::{
    CheckpointTree, Error, LeafValue, ParamInfo, Result, RestoreOptions, SaveOptions,
    ShapeMismatchPolicy, StorageLayout, TensorData, TreeMetadata, ValueCodecRegistry,
};
use storage::aggregate::{self, EncodedLeaf, DEFAULT_LARGE_LEAF_THRESHOLD};
use storage::{legacy, StorageBackend};
use tracing::{debug, warn};

use crate::handler::{join_all, AsyncCheckpointHandler, CheckpointHandler, InFlightWork};

/// Handler for structured trees of typed leaves
pub struct TreeCheckpointHandler {
    storage: Arc<dyn StorageBackend>,
    registry: Arc<ValueCodecRegistry>,
    large_leaf_threshold: usize,
}

impl TreeCheckpointHandler {
    /// Create a handler over a storage backend and codec registry
    pub fn new(storage: Arc<dyn StorageBackend>, registry: Arc<ValueCodecRegistry>) -> Self {
        Self {
            storage,
            registry,
            large_leaf_threshold: DEFAULT_LARGE_LEAF_THRESHOLD,
        }
    }

    /// Override the size above which a leaf gets a dedicated file
    pub fn with_large_leaf_threshold(mut self, threshold: usize) -> Self {
        self.large_leaf_threshold = threshold;
        self
    }

    /// Encode every leaf, one codec call per type-tag group
    fn encode(
        &self,
        item: &CheckpointTree,
        options: &SaveOptions,
    ) -> Result<Vec<EncodedLeaf>> {
        let flat = item.flatten();
        let infos: Vec<ParamInfo> = flat
            .iter()
            .map(|(path, leaf)| {
                ParamInfo::from_leaf(
                    path,
                    leaf,
                    options.type_overrides.get(path).map(String::as_str),
                )
            })
            .collect();

        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, info) in infos.iter().enumerate() {
            groups.entry(info.type_tag.as_str()).or_default().push(i);
        }

        let mut blobs: Vec<Option<Bytes>> = vec![None; flat.len()];
        for (tag, indices) in groups {
            let codec = self.registry.lookup(tag)?;
            let values: Vec<&LeafValue> = indices.iter().map(|&i| flat[i].1).collect();
            let group_infos: Vec<ParamInfo> = indices.iter().map(|&i| infos[i].clone()).collect();
            let encoded = codec.serialize_batch(&values, &group_infos, options)?;
            if encoded.len() != indices.len() {
                return Err(Error::Internal {
                    message: format!(
                        "codec {} returned {} payloads for {} leaves",
                        tag,
                        encoded.len(),
                        indices.len()
                    ),
                });
            }
            for (&i, blob) in indices.iter().zip(encoded) {
                blobs[i] = Some(blob);
            }
        }

        Ok(infos
            .into_iter()
            .zip(blobs)
            .map(|(info, blob)| EncodedLeaf {
                info,
                blob: blob.unwrap_or_default(),
            })
            .collect())
    }

    /// Decode every payload, one codec call per type-tag group, back into
    /// leaves in input order
    fn decode(
        &self,
        infos: &[ParamInfo],
        blobs: &[Bytes],
        options: &RestoreOptions,
    ) -> Result<Vec<LeafValue>> {
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, info) in infos.iter().enumerate() {
            groups.entry(info.type_tag.as_str()).or_default().push(i);
        }

        let mut leaves: Vec<Option<LeafValue>> = (0..infos.len()).map(|_| None).collect();
        for (tag, indices) in groups {
            let codec = self.registry.lookup(tag)?;
            let group_blobs: Vec<Bytes> = indices.iter().map(|&i| blobs[i].clone()).collect();
            let group_infos: Vec<ParamInfo> = indices.iter().map(|&i| infos[i].clone()).collect();
            let decoded = codec.deserialize_batch(&group_blobs, &group_infos, options)?;
            if decoded.len() != indices.len() {
                return Err(Error::Internal {
                    message: format!(
                        "codec {} returned {} leaves for {} payloads",
                        tag,
                        decoded.len(),
                        indices.len()
                    ),
                });
            }
            for (&i, leaf) in indices.iter().zip(decoded) {
                leaves[i] = Some(leaf);
            }
        }

        leaves
            .into_iter()
            .enumerate()
            .map(|(i, leaf)| {
                leaf.ok_or_else(|| Error::Internal {
                    message: format!("leaf {} was never decoded", infos[i].name),
                })
            })
            .collect()
    }
}

#[async_trait]
impl CheckpointHandler for TreeCheckpointHandler {
    async fn save(
        &self,
        directory: &str,
        item: &CheckpointTree,
        options: &SaveOptions,
    ) -> Result<()> {
        let works = self.async_save(directory, item, options).await?;
        match join_all(works).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Never leave the directory partially populated and visible
                if let Err(cleanup) = self.storage.remove_prefix(directory).await {
                    warn!(directory = %directory, error = %cleanup, "Failed to clean up after save failure");
                }
                Err(e)
            }
        }
    }

    async fn restore(&self, directory: &str, options: &RestoreOptions) -> Result<CheckpointTree> {
        let full = match aggregate::read_manifest(self.storage.as_ref(), directory).await? {
            Some(manifest) => {
                let infos = manifest.param_infos();
                let blobs =
                    aggregate::read_blobs(self.storage.as_ref(), directory, &manifest).await?;
                let leaves = self.decode(&infos, &blobs, options)?;
                CheckpointTree::from_parts(&manifest.structure, leaves)?
            }
            None => {
                // Pre-manifest checkpoint: fall back to the legacy layout
                debug!(directory = %directory, "No manifest found, reading legacy layout");
                let legacy_leaves = legacy::read_leaves(self.storage.as_ref(), directory).await?;
                let infos: Vec<ParamInfo> = legacy_leaves
                    .iter()
                    .map(|l| ParamInfo {
                        name: l.name.clone(),
                        type_tag: l.meta.type_tag.clone(),
                        dtype: l.meta.dtype,
                        shape: l.meta.shape.clone(),
                        size_bytes: l.blob.len() as u64,
                    })
                    .collect();
                let blobs: Vec<Bytes> = legacy_leaves.iter().map(|l| l.blob.clone()).collect();
                let leaves = self.decode(&infos, &blobs, options)?;
                let entries = legacy_leaves
                    .into_iter()
                    .map(|l| l.name)
                    .zip(leaves)
                    .collect();
                CheckpointTree::from_flat(entries)?
            }
        };

        match &options.template {
            Some(template) => apply_template(&full, template, options.shape_mismatch),
            None => Ok(full),
        }
    }

    async fn metadata(&self, directory: &str) -> Result<TreeMetadata> {
        match aggregate::read_manifest(self.storage.as_ref(), directory).await? {
            Some(manifest) => Ok(manifest.tree_metadata()),
            None => {
                let metas = legacy::read_metadata(self.storage.as_ref(), directory).await?;
                if metas.is_empty() {
                    return Err(Error::StoragePathNotFound {
                        path: directory.to_string(),
                    });
                }
                Ok(TreeMetadata {
                    leaves: metas
                        .into_iter()
                        .map(|(name, meta)| (name, meta.leaf_metadata(0)))
                        .collect(),
                })
            }
        }
    }
}

#[async_trait]
impl AsyncCheckpointHandler for TreeCheckpointHandler {
    async fn async_save(
        &self,
        directory: &str,
        item: &CheckpointTree,
        options: &SaveOptions,
    ) -> Result<Vec<InFlightWork>> {
        let encoded = self.encode(item, options)?;
        debug!(
            directory = %directory,
            leaves = encoded.len(),
            layout = ?options.layout,
            "Submitting checkpoint writes"
        );

        let mut works = Vec::new();
        match options.layout {
            StorageLayout::Aggregated => {
                let files =
                    aggregate::plan_files(item.structure(), encoded, self.large_leaf_threshold)?;
                for (name, data) in files {
                    let storage = self.storage.clone();
                    let path = format!("{}/{}", directory, name);
                    works.push(InFlightWork::spawn(name, async move {
                        storage.write(&path, data).await.map(|_| ())
                    }));
                }
            }
            StorageLayout::Legacy => {
                for leaf in encoded {
                    let meta = legacy::LegacyLeafMeta::from_info(&leaf.info);
                    let meta_bytes = Bytes::from(serde_json::to_vec(&meta)?);
                    let storage = self.storage.clone();
                    let meta_path = legacy::meta_path(directory, &leaf.info.name);
                    let value_path = legacy::value_path(directory, &leaf.info.name);
                    let blob = leaf.blob;
                    works.push(InFlightWork::spawn(leaf.info.name, async move {
                        storage.write(&meta_path, meta_bytes).await?;
                        storage.write(&value_path, blob).await.map(|_| ())
                    }));
                }
            }
        }
        Ok(works)
    }
}

/// Rebuild the restored tree in the shape of the caller's template.
/// Template leaves missing from the saved tree fail; saved leaves missing
/// from the template are dropped.
fn apply_template(
    full: &CheckpointTree,
    template: &CheckpointTree,
    policy: ShapeMismatchPolicy,
) -> Result<CheckpointTree> {
    let saved: BTreeMap<String, LeafValue> = full
        .flatten()
        .into_iter()
        .map(|(path, leaf)| (path, leaf.clone()))
        .collect();

    fn build(
        template: &CheckpointTree,
        prefix: &str,
        saved: &BTreeMap<String, LeafValue>,
        policy: ShapeMismatchPolicy,
    ) -> Result<CheckpointTree> {
        match template {
            CheckpointTree::Map(m) => {
                let mut out = BTreeMap::new();
                for (key, child) in m {
                    let path = checkpoint_core::join_path(prefix, key);
                    out.insert(key.clone(), build(child, &path, saved, policy)?);
                }
                Ok(CheckpointTree::Map(out))
            }
            CheckpointTree::List(l) => {
                let mut out = Vec::with_capacity(l.len());
                for (i, child) in l.iter().enumerate() {
                    let path = checkpoint_core::join_path(prefix, &i.to_string());
                    out.push(build(child, &path, saved, policy)?);
                }
                Ok(CheckpointTree::List(out))
            }
            CheckpointTree::Leaf(requested) => {
                let value = saved.get(prefix).ok_or_else(|| Error::StructureMismatch {
                    path: prefix.to_string(),
                    reason: "not present in saved checkpoint".to_string(),
                })?;
                reconcile_leaf(prefix, value.clone(), requested, policy)
                    .map(CheckpointTree::Leaf)
            }
        }
    }

    build(template, "", &saved, policy)
}

/// Check a restored leaf against the requested template leaf
fn reconcile_leaf(
    path: &str,
    saved: LeafValue,
    requested: &LeafValue,
    policy: ShapeMismatchPolicy,
) -> Result<LeafValue> {
    if saved.type_tag() != requested.type_tag() {
        return Err(Error::StructureMismatch {
            path: path.to_string(),
            reason: format!(
                "saved type tag {} does not match requested {}",
                saved.type_tag(),
                requested.type_tag()
            ),
        });
    }

    let (LeafValue::Tensor(saved_tensor), LeafValue::Tensor(requested_tensor)) =
        (&saved, requested)
    else {
        return Ok(saved);
    };

    if saved_tensor.dtype != requested_tensor.dtype {
        return Err(Error::StructureMismatch {
            path: path.to_string(),
            reason: format!(
                "saved dtype {:?} does not match requested {:?}",
                saved_tensor.dtype, requested_tensor.dtype
            ),
        });
    }

    if saved_tensor.shape == requested_tensor.shape {
        return Ok(saved);
    }

    match policy {
        ShapeMismatchPolicy::Strict => Err(Error::StructureMismatch {
            path: path.to_string(),
            reason: format!(
                "saved shape {:?} does not match requested {:?}",
                saved_tensor.shape, requested_tensor.shape
            ),
        }),
        ShapeMismatchPolicy::PadOrTruncate => Ok(LeafValue::Tensor(resize_tensor(
            saved_tensor,
            &requested_tensor.shape,
        ))),
    }
}

/// Zero-pad or truncate the raw buffer to a target shape
fn resize_tensor(tensor: &TensorData, target_shape: &[u64]) -> TensorData {
    let mut resized = TensorData::new(tensor.dtype, target_shape.to_vec(), Bytes::new());
    let want = resized.expected_len();
    let mut buf = vec![0u8; want];
    let keep = want.min(tensor.data.len());
    buf[..keep].copy_from_slice(&tensor.data[..keep]);
    resized.data = Bytes::from(buf);
    resized
}
