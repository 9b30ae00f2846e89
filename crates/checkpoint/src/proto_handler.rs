//! Protobuf checkpoint handler
//!
//! Persists one protobuf message per checkpoint as a single binary file.
//! The handler is typed at construction; restore decodes with that type,
//! so a checkpoint written with a different message type fails instead of
//! yielding garbage fields.
//!
//! On the tree surface the message travels as a single bytes leaf; the
//! typed [`to_tree`](ProtoCheckpointHandler::to_tree) and
//! [`from_tree`](ProtoCheckpointHandler::from_tree) helpers convert at
//! the call site.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_core::{
    CheckpointTree, Error, LeafMetadata, LeafValue, Result, RestoreOptions, SaveOptions,
    TreeMetadata,
};
use prost::Message;
use storage::StorageBackend;

use crate::handler::{AsyncCheckpointHandler, CheckpointHandler, InFlightWork};

/// Handler that writes one encoded protobuf message per checkpoint
pub struct ProtoCheckpointHandler<M> {
    storage: Arc<dyn StorageBackend>,
    filename: String,
    _message: PhantomData<fn() -> M>,
}

impl<M: Message + Default> ProtoCheckpointHandler<M> {
    /// Create a handler writing `filename` inside the checkpoint directory
    pub fn new(storage: Arc<dyn StorageBackend>, filename: impl Into<String>) -> Self {
        Self {
            storage,
            filename: filename.into(),
            _message: PhantomData,
        }
    }

    fn file_path(&self, directory: &str) -> String {
        format!("{}/{}", directory, self.filename)
    }

    /// Wrap an encoded message as the single-leaf tree this handler saves
    pub fn to_tree(message: &M) -> CheckpointTree {
        CheckpointTree::leaf(LeafValue::Bytes(Bytes::from(message.encode_to_vec())))
    }

    /// Decode the message back out of a tree produced by
    /// [`restore`](CheckpointHandler::restore)
    pub fn from_tree(tree: &CheckpointTree) -> Result<M> {
        let CheckpointTree::Leaf(LeafValue::Bytes(raw)) = tree else {
            return Err(Error::StructureMismatch {
                path: String::new(),
                reason: "expected a single bytes leaf holding an encoded message".to_string(),
            });
        };
        decode::<M>(raw)
    }

    /// Validate the payload decodes as `M` before anything is written
    fn encode(&self, item: &CheckpointTree) -> Result<Bytes> {
        let message = Self::from_tree(item)?;
        Ok(Bytes::from(message.encode_to_vec()))
    }
}

fn decode<M: Message + Default>(raw: &Bytes) -> Result<M> {
    M::decode(raw.clone()).map_err(|e| Error::Serialization(format!("message decode: {}", e)))
}

#[async_trait]
impl<M: Message + Default> CheckpointHandler for ProtoCheckpointHandler<M> {
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

    /// The restore template is not consulted; the message type fixed at
    /// construction governs decoding.
    async fn restore(&self, directory: &str, _options: &RestoreOptions) -> Result<CheckpointTree> {
        let raw = self.storage.read(&self.file_path(directory)).await?;
        let message = decode::<M>(&raw)?;
        Ok(Self::to_tree(&message))
    }

    async fn metadata(&self, directory: &str) -> Result<TreeMetadata> {
        let raw = self.storage.read(&self.file_path(directory)).await?;
        let leaves = [(
            self.filename.clone(),
            LeafMetadata {
                type_tag: "bytes".to_string(),
                dtype: None,
                shape: None,
                size_bytes: raw.len() as u64,
            },
        )]
        .into_iter()
        .collect();
        Ok(TreeMetadata { leaves })
    }
}

#[async_trait]
impl<M: Message + Default> AsyncCheckpointHandler for ProtoCheckpointHandler<M> {
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
