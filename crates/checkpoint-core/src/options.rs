//! Per-call save and restore options

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::tree::CheckpointTree;

/// On-disk representation of a saved tree
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageLayout {
    /// One manifest plus a bounded number of aggregated data files
    #[default]
    Aggregated,

    /// One subdirectory per leaf; readable but no longer written by default
    Legacy,
}

/// How to reconcile a restored tensor whose saved shape differs from the
/// requested template shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShapeMismatchPolicy {
    /// Fail with a structure mismatch
    #[default]
    Strict,

    /// Zero-pad or truncate the raw buffer to the template shape
    PadOrTruncate,
}

/// Options supplied by the producer for one save call
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Bypass the existing-directory check (and the save-interval rule
    /// when saving through a manager)
    pub force_overwrite: bool,

    /// Layout to write
    pub layout: StorageLayout,

    /// Per-leaf codec selection, keyed by leaf path. The override becomes
    /// the persisted tag, so restore re-selects the overriding codec and
    /// yields its leaf variant, not the original one.
    pub type_overrides: HashMap<String, String>,
}

/// Options supplied for one restore call
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Target structure/layout; leaves of the template absent from the
    /// saved tree fail the restore, saved leaves absent from the template
    /// are dropped
    pub template: Option<CheckpointTree>,

    /// Policy for shape-divergent tensor leaves when a template is given
    pub shape_mismatch: ShapeMismatchPolicy,
}
