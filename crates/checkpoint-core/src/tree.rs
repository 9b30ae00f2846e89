//! Checkpointable value tree model
//!
//! A checkpointable item is a tree of named sub-values whose leaves are
//! typed: raw tensor buffers, scalars, strings, opaque bytes, or custom
//! values routed to user-registered codecs.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Type tag for tensor leaves
pub const TAG_TENSOR: &str = "tensor";
/// Type tag for scalar leaves
pub const TAG_SCALAR: &str = "scalar";
/// Type tag for string leaves
pub const TAG_STR: &str = "str";
/// Type tag for raw byte leaves
pub const TAG_BYTES: &str = "bytes";

/// Element type of a tensor leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    U8,
    Bool,
}

impl DType {
    /// Size of one element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 | DType::Bool => 1,
        }
    }
}

/// Raw tensor buffer with its declared dtype and shape
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    /// Element type
    pub dtype: DType,

    /// Dimensions, row-major
    pub shape: Vec<u64>,

    /// Raw little-endian element buffer
    pub data: Bytes,
}

impl TensorData {
    /// Create a new tensor leaf
    pub fn new(dtype: DType, shape: Vec<u64>, data: Bytes) -> Self {
        Self { dtype, shape, data }
    }

    /// Number of bytes the shape and dtype imply
    pub fn expected_len(&self) -> usize {
        self.shape.iter().product::<u64>() as usize * self.dtype.size_bytes()
    }
}

/// Scalar leaf value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    F64(f64),
    I64(i64),
    Bool(bool),
}

/// Atomic value at the bottom of a checkpointable tree
#[derive(Debug, Clone, PartialEq)]
pub enum LeafValue {
    Tensor(TensorData),
    Scalar(Scalar),
    Str(String),
    Bytes(Bytes),

    /// Opaque payload handled by a user-registered codec
    Custom { tag: String, data: Bytes },
}

impl LeafValue {
    /// Stable identifier used to select a codec; persisted in manifests
    /// so the codec can be re-selected on restore.
    pub fn type_tag(&self) -> &str {
        match self {
            LeafValue::Tensor(_) => TAG_TENSOR,
            LeafValue::Scalar(_) => TAG_SCALAR,
            LeafValue::Str(_) => TAG_STR,
            LeafValue::Bytes(_) => TAG_BYTES,
            LeafValue::Custom { tag, .. } => tag,
        }
    }

    /// Declared dtype, for tensor leaves
    pub fn dtype(&self) -> Option<DType> {
        match self {
            LeafValue::Tensor(t) => Some(t.dtype),
            _ => None,
        }
    }

    /// Declared shape, for tensor leaves
    pub fn shape(&self) -> Option<Vec<u64>> {
        match self {
            LeafValue::Tensor(t) => Some(t.shape.clone()),
            _ => None,
        }
    }

    /// Size of the leaf payload in bytes
    pub fn size_bytes(&self) -> u64 {
        match self {
            LeafValue::Tensor(t) => t.data.len() as u64,
            LeafValue::Scalar(_) => 8,
            LeafValue::Str(s) => s.len() as u64,
            LeafValue::Bytes(b) => b.len() as u64,
            LeafValue::Custom { data, .. } => data.len() as u64,
        }
    }

    /// Copy whose storage does not alias `self`
    pub fn deep_copy(&self) -> Self {
        match self {
            LeafValue::Tensor(t) => LeafValue::Tensor(TensorData::new(
                t.dtype,
                t.shape.clone(),
                Bytes::copy_from_slice(&t.data),
            )),
            LeafValue::Scalar(s) => LeafValue::Scalar(s.clone()),
            LeafValue::Str(s) => LeafValue::Str(s.clone()),
            LeafValue::Bytes(b) => LeafValue::Bytes(Bytes::copy_from_slice(b)),
            LeafValue::Custom { tag, data } => LeafValue::Custom {
                tag: tag.clone(),
                data: Bytes::copy_from_slice(data),
            },
        }
    }
}

/// Structured tree of checkpointable values
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointTree {
    /// Ordered mapping of named sub-trees
    Map(BTreeMap<String, CheckpointTree>),

    /// Sequence of sub-trees
    List(Vec<CheckpointTree>),

    /// Terminal value
    Leaf(LeafValue),
}

/// Shape of a tree without its leaf payloads; leaf nodes reference
/// positions in the flattened leaf order. Persisted in manifests so a
/// restored tree nests exactly as it was saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeStructure {
    Map { children: BTreeMap<String, TreeStructure> },
    List { children: Vec<TreeStructure> },
    Leaf { index: usize },
}

impl CheckpointTree {
    /// Convenience constructor for a map tree
    pub fn map(entries: impl IntoIterator<Item = (String, CheckpointTree)>) -> Self {
        CheckpointTree::Map(entries.into_iter().collect())
    }

    /// Convenience constructor for a leaf
    pub fn leaf(value: LeafValue) -> Self {
        CheckpointTree::Leaf(value)
    }

    /// Number of leaves in the tree
    pub fn leaf_count(&self) -> usize {
        match self {
            CheckpointTree::Map(m) => m.values().map(|c| c.leaf_count()).sum(),
            CheckpointTree::List(l) => l.iter().map(|c| c.leaf_count()).sum(),
            CheckpointTree::Leaf(_) => 1,
        }
    }

    /// Flatten to `(path, leaf)` pairs in deterministic order. Paths join
    /// map keys and list positions with `/`.
    pub fn flatten(&self) -> Vec<(String, &LeafValue)> {
        let mut out = Vec::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a LeafValue)>) {
        match self {
            CheckpointTree::Map(m) => {
                for (key, child) in m {
                    child.flatten_into(&join_path(prefix, key), out);
                }
            }
            CheckpointTree::List(l) => {
                for (i, child) in l.iter().enumerate() {
                    child.flatten_into(&join_path(prefix, &i.to_string()), out);
                }
            }
            CheckpointTree::Leaf(v) => out.push((prefix.to_string(), v)),
        }
    }

    /// Structure descriptor with leaf indices in flatten order
    pub fn structure(&self) -> TreeStructure {
        let mut next = 0usize;
        self.structure_impl(&mut next)
    }

    fn structure_impl(&self, next: &mut usize) -> TreeStructure {
        match self {
            CheckpointTree::Map(m) => TreeStructure::Map {
                children: m
                    .iter()
                    .map(|(k, c)| (k.clone(), c.structure_impl(next)))
                    .collect(),
            },
            CheckpointTree::List(l) => TreeStructure::List {
                children: l.iter().map(|c| c.structure_impl(next)).collect(),
            },
            CheckpointTree::Leaf(_) => {
                let index = *next;
                *next += 1;
                TreeStructure::Leaf { index }
            }
        }
    }

    /// Rebuild a tree from a structure descriptor and leaves indexed in
    /// flatten order
    pub fn from_parts(structure: &TreeStructure, leaves: Vec<LeafValue>) -> Result<Self> {
        let mut slots: Vec<Option<LeafValue>> = leaves.into_iter().map(Some).collect();
        Self::from_parts_impl(structure, &mut slots)
    }

    fn from_parts_impl(
        structure: &TreeStructure,
        slots: &mut Vec<Option<LeafValue>>,
    ) -> Result<Self> {
        match structure {
            TreeStructure::Map { children } => {
                let mut m = BTreeMap::new();
                for (k, c) in children {
                    m.insert(k.clone(), Self::from_parts_impl(c, slots)?);
                }
                Ok(CheckpointTree::Map(m))
            }
            TreeStructure::List { children } => {
                let mut l = Vec::with_capacity(children.len());
                for c in children {
                    l.push(Self::from_parts_impl(c, slots)?);
                }
                Ok(CheckpointTree::List(l))
            }
            TreeStructure::Leaf { index } => slots
                .get_mut(*index)
                .and_then(|slot| slot.take())
                .map(CheckpointTree::Leaf)
                .ok_or_else(|| Error::StructureMismatch {
                    path: format!("leaf[{}]", index),
                    reason: "leaf index out of range for saved data".to_string(),
                }),
        }
    }

    /// Rebuild nesting from flat `(path, leaf)` pairs. Used for the legacy
    /// layout, which has no structure descriptor: a map level whose keys
    /// are exactly the decimal strings `0..n` is interpreted as a list.
    pub fn from_flat(entries: Vec<(String, LeafValue)>) -> Result<Self> {
        #[derive(Debug)]
        enum Node {
            Map(BTreeMap<String, Node>),
            Leaf(LeafValue),
        }

        fn insert(node: &mut Node, path: &str, segments: &[&str], leaf: LeafValue) -> Result<()> {
            match segments {
                [] => Err(Error::StructureMismatch {
                    path: path.to_string(),
                    reason: "empty leaf path".to_string(),
                }),
                [last] => match node {
                    Node::Map(m) => {
                        if m.insert(last.to_string(), Node::Leaf(leaf)).is_some() {
                            return Err(Error::StructureMismatch {
                                path: path.to_string(),
                                reason: "duplicate leaf path".to_string(),
                            });
                        }
                        Ok(())
                    }
                    Node::Leaf(_) => Err(Error::StructureMismatch {
                        path: path.to_string(),
                        reason: "leaf path collides with an inner node".to_string(),
                    }),
                },
                [head, rest @ ..] => match node {
                    Node::Map(m) => {
                        let child = m
                            .entry(head.to_string())
                            .or_insert_with(|| Node::Map(BTreeMap::new()));
                        insert(child, path, rest, leaf)
                    }
                    Node::Leaf(_) => Err(Error::StructureMismatch {
                        path: path.to_string(),
                        reason: "leaf path collides with an inner node".to_string(),
                    }),
                },
            }
        }

        fn finish(node: Node) -> CheckpointTree {
            match node {
                Node::Leaf(v) => CheckpointTree::Leaf(v),
                Node::Map(m) => {
                    let is_list = !m.is_empty()
                        && m.keys()
                            .all(|k| k.parse::<usize>().map_or(false, |i| i.to_string() == *k))
                        && (0..m.len()).all(|i| m.contains_key(&i.to_string()));
                    if is_list {
                        let mut items: Vec<(usize, Node)> = m
                            .into_iter()
                            .map(|(k, v)| (k.parse::<usize>().unwrap_or(0), v))
                            .collect();
                        items.sort_by_key(|(i, _)| *i);
                        CheckpointTree::List(items.into_iter().map(|(_, v)| finish(v)).collect())
                    } else {
                        CheckpointTree::Map(m.into_iter().map(|(k, v)| (k, finish(v))).collect())
                    }
                }
            }
        }

        let mut root = Node::Map(BTreeMap::new());
        for (path, leaf) in entries {
            let segments: Vec<&str> = path.split('/').collect();
            insert(&mut root, &path, &segments, leaf)?;
        }
        Ok(finish(root))
    }

    /// Copy of the whole tree whose leaf storage does not alias `self`.
    /// This is the data side of the stable-copy (materialization) phase.
    pub fn deep_copy(&self) -> Self {
        match self {
            CheckpointTree::Map(m) => CheckpointTree::Map(
                m.iter().map(|(k, c)| (k.clone(), c.deep_copy())).collect(),
            ),
            CheckpointTree::List(l) => {
                CheckpointTree::List(l.iter().map(|c| c.deep_copy()).collect())
            }
            CheckpointTree::Leaf(v) => CheckpointTree::Leaf(v.deep_copy()),
        }
    }
}

/// Join tree path segments: empty prefix yields the segment itself
pub fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}/{}", prefix, segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> CheckpointTree {
        CheckpointTree::map([
            (
                "params".to_string(),
                CheckpointTree::map([
                    (
                        "kernel".to_string(),
                        CheckpointTree::leaf(LeafValue::Tensor(TensorData::new(
                            DType::F32,
                            vec![2, 2],
                            Bytes::from(vec![0u8; 16]),
                        ))),
                    ),
                    (
                        "bias".to_string(),
                        CheckpointTree::leaf(LeafValue::Tensor(TensorData::new(
                            DType::F32,
                            vec![2],
                            Bytes::from(vec![1u8; 8]),
                        ))),
                    ),
                ]),
            ),
            (
                "step".to_string(),
                CheckpointTree::leaf(LeafValue::Scalar(Scalar::I64(42))),
            ),
            (
                "layers".to_string(),
                CheckpointTree::List(vec![
                    CheckpointTree::leaf(LeafValue::Str("dense".to_string())),
                    CheckpointTree::leaf(LeafValue::Str("relu".to_string())),
                ]),
            ),
        ])
    }

    #[test]
    fn test_flatten_paths() {
        let tree = sample_tree();
        let paths: Vec<String> = tree.flatten().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            paths,
            vec!["layers/0", "layers/1", "params/bias", "params/kernel", "step"]
        );
    }

    #[test]
    fn test_structure_round_trip() {
        let tree = sample_tree();
        let structure = tree.structure();
        let leaves: Vec<LeafValue> =
            tree.flatten().into_iter().map(|(_, v)| v.clone()).collect();
        let rebuilt = CheckpointTree::from_parts(&structure, leaves).unwrap();
        assert_eq!(rebuilt, tree);
    }

    #[test]
    fn test_from_flat_recovers_lists() {
        let tree = sample_tree();
        let flat: Vec<(String, LeafValue)> = tree
            .flatten()
            .into_iter()
            .map(|(p, v)| (p, v.clone()))
            .collect();
        let rebuilt = CheckpointTree::from_flat(flat).unwrap();
        assert_eq!(rebuilt, tree);
    }

    #[test]
    fn test_from_flat_duplicate_path() {
        let entries = vec![
            ("a".to_string(), LeafValue::Scalar(Scalar::I64(1))),
            ("a".to_string(), LeafValue::Scalar(Scalar::I64(2))),
        ];
        let err = CheckpointTree::from_flat(entries).unwrap_err();
        assert!(matches!(err, Error::StructureMismatch { .. }));
    }

    #[test]
    fn test_deep_copy_does_not_alias() {
        let data = Bytes::from(vec![7u8; 32]);
        let tree = CheckpointTree::leaf(LeafValue::Tensor(TensorData::new(
            DType::U8,
            vec![32],
            data.clone(),
        )));
        let copy = tree.deep_copy();
        assert_eq!(copy, tree);

        let (CheckpointTree::Leaf(LeafValue::Tensor(orig)), CheckpointTree::Leaf(LeafValue::Tensor(copied))) =
            (&tree, &copy)
        else {
            panic!("expected tensor leaves");
        };
        assert_ne!(orig.data.as_ptr(), copied.data.as_ptr());
    }

    #[test]
    fn test_expected_len() {
        let t = TensorData::new(DType::F64, vec![3, 4], Bytes::new());
        assert_eq!(t.expected_len(), 96);
    }
}
