//! Aggregated checkpoint layout
//!
//! Packs many encoded leaves into a bounded number of data files plus one
//! structural manifest, instead of one file per leaf. The manifest names
//! the tree structure and, per leaf, its type tag and an opaque storage
//! reference into the pack. Leaves above a size threshold go to dedicated
//! files; that is a storage optimization, not a structural requirement.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use checkpoint_core::{
    DType, Error, LeafMetadata, ParamInfo, Result, TreeMetadata, TreeStructure,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::StorageBackend;

/// Manifest file name within a saved tree directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Pack file holding all small leaf payloads
pub const PACK_FILE: &str = "data-0.bin";

/// Manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Leaves at or above this size get a dedicated file by default
pub const DEFAULT_LARGE_LEAF_THRESHOLD: usize = 8 * 1024 * 1024;

/// Opaque storage reference for one leaf payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageRef {
    /// Byte range within a shared pack file
    Packed { file: String, offset: u64, length: u64 },

    /// Whole dedicated file
    Dedicated { file: String },
}

/// One leaf entry in the manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestLeaf {
    /// Leaf path within the tree
    pub name: String,

    /// Codec type tag the leaf was saved with
    pub type_tag: String,

    /// Declared element type, for tensor leaves
    pub dtype: Option<DType>,

    /// Declared shape, for tensor leaves
    pub shape: Option<Vec<u64>>,

    /// Where the payload lives
    pub storage: StorageRef,
}

/// Structural manifest of a saved tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Manifest format version
    pub version: u32,

    /// Tree structure with leaf indices in flatten order
    pub structure: TreeStructure,

    /// Leaf entries in flatten order
    pub leaves: Vec<ManifestLeaf>,
}

impl Manifest {
    /// Restore-cheap descriptor of the whole tree
    pub fn tree_metadata(&self) -> TreeMetadata {
        TreeMetadata {
            leaves: self
                .leaves
                .iter()
                .map(|leaf| {
                    let length = match &leaf.storage {
                        StorageRef::Packed { length, .. } => *length,
                        StorageRef::Dedicated { .. } => 0,
                    };
                    (
                        leaf.name.clone(),
                        LeafMetadata {
                            type_tag: leaf.type_tag.clone(),
                            dtype: leaf.dtype,
                            shape: leaf.shape.clone(),
                            size_bytes: length,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Save-time `ParamInfo`s reconstructed from the manifest, used to
    /// re-drive codec dispatch on restore
    pub fn param_infos(&self) -> Vec<ParamInfo> {
        self.leaves
            .iter()
            .map(|leaf| ParamInfo {
                name: leaf.name.clone(),
                type_tag: leaf.type_tag.clone(),
                dtype: leaf.dtype,
                shape: leaf.shape.clone(),
                size_bytes: match &leaf.storage {
                    StorageRef::Packed { length, .. } => *length,
                    StorageRef::Dedicated { .. } => 0,
                },
            })
            .collect()
    }
}

/// One encoded leaf, in flatten order
#[derive(Debug)]
pub struct EncodedLeaf {
    /// Save-time descriptor
    pub info: ParamInfo,

    /// Encoded payload
    pub blob: Bytes,
}

/// Plan the files of an aggregated save: the manifest plus the pack and
/// any dedicated files, as `(relative path, contents)` pairs.
///
/// `leaves` must be in the flatten order the `structure` indices refer to.
pub fn plan_files(
    structure: TreeStructure,
    leaves: Vec<EncodedLeaf>,
    large_leaf_threshold: usize,
) -> Result<Vec<(String, Bytes)>> {
    let mut pack = BytesMut::new();
    let mut files = Vec::new();
    let mut manifest_leaves = Vec::with_capacity(leaves.len());
    let mut dedicated = 0usize;

    for leaf in leaves {
        let storage = if leaf.blob.len() >= large_leaf_threshold {
            let file = format!("d/{}.bin", dedicated);
            dedicated += 1;
            files.push((file.clone(), leaf.blob));
            StorageRef::Dedicated { file }
        } else {
            let offset = pack.len() as u64;
            pack.extend_from_slice(&leaf.blob);
            StorageRef::Packed {
                file: PACK_FILE.to_string(),
                offset,
                length: leaf.blob.len() as u64,
            }
        };
        manifest_leaves.push(ManifestLeaf {
            name: leaf.info.name,
            type_tag: leaf.info.type_tag,
            dtype: leaf.info.dtype,
            shape: leaf.info.shape,
            storage,
        });
    }

    if !pack.is_empty() {
        files.push((PACK_FILE.to_string(), pack.freeze()));
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        structure,
        leaves: manifest_leaves,
    };
    let encoded = serde_json::to_vec_pretty(&manifest)?;
    files.push((MANIFEST_FILE.to_string(), Bytes::from(encoded)));

    debug!(
        files = files.len(),
        dedicated = dedicated,
        "Planned aggregated layout"
    );
    Ok(files)
}

/// Read and parse the manifest of a saved tree; `None` means the directory
/// predates the aggregated layout (legacy)
pub async fn read_manifest(storage: &dyn StorageBackend, dir: &str) -> Result<Option<Manifest>> {
    let path = format!("{}/{}", dir, MANIFEST_FILE);
    let data = match storage.read(&path).await {
        Ok(data) => data,
        Err(Error::StoragePathNotFound { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };

    let manifest: Manifest = serde_json::from_slice(&data)?;
    if manifest.version > MANIFEST_VERSION {
        return Err(Error::Storage {
            message: format!(
                "manifest version {} in {} is newer than supported {}",
                manifest.version, dir, MANIFEST_VERSION
            ),
        });
    }
    Ok(Some(manifest))
}

/// Read every leaf payload of an aggregated tree, in manifest (flatten)
/// order. Each pack file is read once and sliced per leaf.
pub async fn read_blobs(
    storage: &dyn StorageBackend,
    dir: &str,
    manifest: &Manifest,
) -> Result<Vec<Bytes>> {
    let mut packs: HashMap<&str, Bytes> = HashMap::new();
    for leaf in &manifest.leaves {
        if let StorageRef::Packed { file, .. } = &leaf.storage {
            if !packs.contains_key(file.as_str()) {
                let data = storage.read(&format!("{}/{}", dir, file)).await?;
                packs.insert(file.as_str(), data);
            }
        }
    }

    let mut blobs = Vec::with_capacity(manifest.leaves.len());
    for leaf in &manifest.leaves {
        let blob = match &leaf.storage {
            StorageRef::Packed {
                file,
                offset,
                length,
            } => {
                let pack = packs.get(file.as_str()).ok_or_else(|| Error::Storage {
                    message: format!("pack file {} missing for leaf {}", file, leaf.name),
                })?;
                let start = *offset as usize;
                let end = start + *length as usize;
                if end > pack.len() {
                    return Err(Error::Storage {
                        message: format!(
                            "leaf {} references bytes {}..{} beyond pack file {} ({} bytes)",
                            leaf.name,
                            start,
                            end,
                            file,
                            pack.len()
                        ),
                    });
                }
                pack.slice(start..end)
            }
            StorageRef::Dedicated { file } => {
                storage.read(&format!("{}/{}", dir, file)).await?
            }
        };
        blobs.push(blob);
    }
    Ok(blobs)
}
