//! Value codec registry
//!
//! An explicit registry object injected at construction time; there is no
//! process-global registration. Handlers resolve codecs by the stable type
//! tag recorded in manifests.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::codec::{BytesCodec, ScalarCodec, StrCodec, TensorCodec, ValueCodec};
use crate::{Error, Result};

/// Thread-safe mapping from type tag to codec
pub struct ValueCodecRegistry {
    /// Map of type tag to codec
    codecs: DashMap<String, Arc<dyn ValueCodec>>,
}

impl ValueCodecRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            codecs: DashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in tensor, scalar, string and
    /// bytes codecs
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for codec in [
            Arc::new(TensorCodec) as Arc<dyn ValueCodec>,
            Arc::new(ScalarCodec),
            Arc::new(StrCodec),
            Arc::new(BytesCodec),
        ] {
            // Fresh registry, tags cannot collide
            let _ = registry.register(codec, false);
        }
        registry
    }

    /// Register a codec under its type tag. Without `override_existing`,
    /// registering a tag twice fails.
    pub fn register(&self, codec: Arc<dyn ValueCodec>, override_existing: bool) -> Result<()> {
        let tag = codec.type_tag().to_string();
        if !override_existing && self.codecs.contains_key(&tag) {
            return Err(Error::AlreadyRegistered { type_tag: tag });
        }
        info!(type_tag = %tag, "Codec registered");
        self.codecs.insert(tag, codec);
        Ok(())
    }

    /// Resolve the codec for a type tag
    pub fn lookup(&self, type_tag: &str) -> Result<Arc<dyn ValueCodec>> {
        self.codecs
            .get(type_tag)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotRegistered {
                type_tag: type_tag.to_string(),
            })
    }

    /// Check whether a codec is registered for a type tag
    pub fn has_codec(&self, type_tag: &str) -> bool {
        self.codecs.contains_key(type_tag)
    }

    /// All registered type tags, sorted
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.codecs.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }
}

impl Default for ValueCodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
