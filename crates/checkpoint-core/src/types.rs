//! Core type definitions for the checkpoint persistence engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::tree::{DType, LeafValue};

/// Caller-assigned, monotonically non-decreasing checkpoint generation
pub type Step = u64;

/// Commit status of one checkpoint generation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StepStatus {
    /// Save dispatched, background work outstanding
    Pending,

    /// Every item fully written and the step directory promoted
    Committed,

    /// Removed under retention pressure
    Deleted,
}

/// One committed or in-progress checkpoint generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step number
    pub step: Step,

    /// Directory location (relative to the storage backend root)
    pub path: String,

    /// Named items the step contains
    pub items: Vec<String>,

    /// Commit status
    pub status: StepStatus,

    /// Timestamp when the step was created
    pub created_at: DateTime<Utc>,
}

/// Per-step metadata persisted inside the step directory before commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetadata {
    /// Step number
    pub step: Step,

    /// Named items the step contains
    pub items: Vec<String>,

    /// Timestamp when the step was created
    pub created_at: DateTime<Utc>,
}

/// Per-leaf descriptor created at save-dispatch time; immutable thereafter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamInfo {
    /// Logical path of the leaf within its tree
    pub name: String,

    /// Codec type tag selected for the leaf
    pub type_tag: String,

    /// Declared element type, for tensor leaves
    pub dtype: Option<DType>,

    /// Declared shape, for tensor leaves
    pub shape: Option<Vec<u64>>,

    /// Payload size in bytes
    pub size_bytes: u64,
}

impl ParamInfo {
    /// Build the descriptor for a leaf, honoring a per-leaf codec override
    pub fn from_leaf(name: &str, leaf: &LeafValue, tag_override: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            type_tag: tag_override.unwrap_or(leaf.type_tag()).to_string(),
            dtype: leaf.dtype(),
            shape: leaf.shape(),
            size_bytes: leaf.size_bytes(),
        }
    }
}

/// Restore-cheap descriptor of one saved leaf
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeafMetadata {
    /// Codec type tag the leaf was saved with
    pub type_tag: String,

    /// Declared element type, for tensor leaves
    pub dtype: Option<DType>,

    /// Declared shape, for tensor leaves
    pub shape: Option<Vec<u64>>,

    /// Payload size in bytes
    pub size_bytes: u64,
}

impl LeafMetadata {
    /// Descriptor derived from a save-time `ParamInfo`
    pub fn from_info(info: &ParamInfo) -> Self {
        Self {
            type_tag: info.type_tag.clone(),
            dtype: info.dtype,
            shape: info.shape.clone(),
            size_bytes: info.size_bytes,
        }
    }
}

/// Restore-cheap descriptor of a whole saved tree, keyed by leaf path
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TreeMetadata {
    /// Leaf descriptors in flatten order
    pub leaves: BTreeMap<String, LeafMetadata>,
}
