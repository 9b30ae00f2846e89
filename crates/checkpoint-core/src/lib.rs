//! Checkpoint Core - Foundation for the checkpoint persistence engine
//!
//! Provides the checkpointable value tree model, the batched value codec
//! registry, error handling, and the per-call option types shared by the
//! storage and orchestration crates.

pub mod codec;
pub mod error;
pub mod options;
pub mod registry;
pub mod tree;
pub mod types;

pub use codec::{BytesCodec, ScalarCodec, StrCodec, TensorCodec, ValueCodec};
pub use error::{Error, Result};
pub use options::{RestoreOptions, SaveOptions, ShapeMismatchPolicy, StorageLayout};
pub use registry::ValueCodecRegistry;
pub use tree::{
    join_path, CheckpointTree, DType, LeafValue, Scalar, TensorData, TreeStructure,
};
pub use types::{
    LeafMetadata, ParamInfo, Step, StepMetadata, StepRecord, StepStatus, TreeMetadata,
};
