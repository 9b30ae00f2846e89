//! Legacy one-directory-per-leaf layout
//!
//! The format that predates the aggregated manifest: each leaf lives in
//! its own subdirectory holding `value.bin` and a small `meta.json`.
//! Readers must keep supporting it (forward migration only); writers can
//! still produce it via `StorageLayout::Legacy`.

use bytes::Bytes;
use checkpoint_core::{DType, Error, LeafMetadata, ParamInfo, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::StorageBackend;

/// Payload file name within a leaf directory
pub const VALUE_FILE: &str = "value.bin";

/// Descriptor file name within a leaf directory
pub const META_FILE: &str = "meta.json";

/// Per-leaf descriptor persisted beside the payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LegacyLeafMeta {
    /// Codec type tag the leaf was saved with
    pub type_tag: String,

    /// Declared element type, for tensor leaves
    pub dtype: Option<DType>,

    /// Declared shape, for tensor leaves
    pub shape: Option<Vec<u64>>,
}

impl LegacyLeafMeta {
    /// Descriptor derived from a save-time `ParamInfo`
    pub fn from_info(info: &ParamInfo) -> Self {
        Self {
            type_tag: info.type_tag.clone(),
            dtype: info.dtype,
            shape: info.shape.clone(),
        }
    }

    /// Restore-cheap descriptor for this leaf
    pub fn leaf_metadata(&self, size_bytes: u64) -> LeafMetadata {
        LeafMetadata {
            type_tag: self.type_tag.clone(),
            dtype: self.dtype,
            shape: self.shape.clone(),
            size_bytes,
        }
    }
}

/// Relative path of a leaf's payload file
pub fn value_path(dir: &str, leaf_name: &str) -> String {
    format!("{}/{}/{}", dir, leaf_name, VALUE_FILE)
}

/// Relative path of a leaf's descriptor file
pub fn meta_path(dir: &str, leaf_name: &str) -> String {
    format!("{}/{}/{}", dir, leaf_name, META_FILE)
}

/// One leaf read back from a legacy directory
#[derive(Debug)]
pub struct LegacyLeaf {
    /// Leaf path within the tree
    pub name: String,

    /// Persisted descriptor
    pub meta: LegacyLeafMeta,

    /// Raw payload
    pub blob: Bytes,
}

/// Discover the leaf names of a legacy tree directory, sorted
pub async fn list_leaves(storage: &dyn StorageBackend, dir: &str) -> Result<Vec<String>> {
    let prefix = format!("{}/", dir);
    let suffix = format!("/{}", META_FILE);
    let mut names: Vec<String> = storage
        .list(&prefix)
        .await?
        .into_iter()
        .filter_map(|path| {
            path.strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
                .map(|name| name.to_string())
        })
        .collect();
    names.sort();
    Ok(names)
}

/// Read back every leaf of a legacy tree directory, sorted by name
pub async fn read_leaves(storage: &dyn StorageBackend, dir: &str) -> Result<Vec<LegacyLeaf>> {
    let names = list_leaves(storage, dir).await?;
    if names.is_empty() {
        return Err(Error::Storage {
            message: format!("{} holds neither a manifest nor legacy leaves", dir),
        });
    }

    debug!(dir = %dir, leaves = names.len(), "Reading legacy layout");

    let mut leaves = Vec::with_capacity(names.len());
    for name in names {
        let meta_bytes = storage.read(&meta_path(dir, &name)).await?;
        let meta: LegacyLeafMeta = serde_json::from_slice(&meta_bytes)?;
        let blob = storage.read(&value_path(dir, &name)).await?;
        leaves.push(LegacyLeaf { name, meta, blob });
    }
    Ok(leaves)
}

/// Read only the leaf descriptors of a legacy tree directory
pub async fn read_metadata(
    storage: &dyn StorageBackend,
    dir: &str,
) -> Result<Vec<(String, LegacyLeafMeta)>> {
    let names = list_leaves(storage, dir).await?;
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let meta_bytes = storage.read(&meta_path(dir, &name)).await?;
        let meta: LegacyLeafMeta = serde_json::from_slice(&meta_bytes)?;
        out.push((name, meta));
    }
    Ok(out)
}
