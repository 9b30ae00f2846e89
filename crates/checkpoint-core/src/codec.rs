//! Value codecs: batched per-type serialization
//!
//! A codec owns one leaf type, identified by its stable type tag. The
//! dispatching handler groups same-tagged leaves and calls the codec once
//! per batch; codecs must handle batches larger than one.

use bytes::Bytes;

use crate::tree::{LeafValue, Scalar, TensorData, TAG_BYTES, TAG_SCALAR, TAG_STR, TAG_TENSOR};
use crate::types::{LeafMetadata, ParamInfo};
use crate::{Error, Result, RestoreOptions, SaveOptions};

/// Batched serialize/deserialize/describe for one leaf type
pub trait ValueCodec: Send + Sync {
    /// Stable identifier persisted in manifests and used to re-select the
    /// codec on restore
    fn type_tag(&self) -> &str;

    /// Encode a batch of same-tagged leaves. Failures name the specific
    /// leaf via its `ParamInfo`; callers do not retry.
    fn serialize_batch(
        &self,
        values: &[&LeafValue],
        infos: &[ParamInfo],
        options: &SaveOptions,
    ) -> Result<Vec<Bytes>>;

    /// Decode a batch of payloads back into leaves
    fn deserialize_batch(
        &self,
        blobs: &[Bytes],
        infos: &[ParamInfo],
        options: &RestoreOptions,
    ) -> Result<Vec<LeafValue>>;

    /// Restore-cheap descriptors for a batch of leaves
    fn describe(&self, infos: &[ParamInfo]) -> Vec<LeafMetadata> {
        infos.iter().map(LeafMetadata::from_info).collect()
    }
}

impl std::fmt::Debug for dyn ValueCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ValueCodec").field(&self.type_tag()).finish()
    }
}

/// Codec for raw tensor buffers: the payload is the little-endian element
/// buffer itself; dtype and shape travel in the manifest.
pub struct TensorCodec;

impl ValueCodec for TensorCodec {
    fn type_tag(&self) -> &str {
        TAG_TENSOR
    }

    fn serialize_batch(
        &self,
        values: &[&LeafValue],
        infos: &[ParamInfo],
        _options: &SaveOptions,
    ) -> Result<Vec<Bytes>> {
        values
            .iter()
            .zip(infos)
            .map(|(value, info)| match value {
                LeafValue::Tensor(t) => {
                    if t.data.len() != t.expected_len() {
                        return Err(Error::Serialization(format!(
                            "tensor {} has {} bytes but shape/dtype imply {}",
                            info.name,
                            t.data.len(),
                            t.expected_len()
                        )));
                    }
                    Ok(t.data.clone())
                }
                other => Err(Error::Serialization(format!(
                    "leaf {} is not a tensor (tag {})",
                    info.name,
                    other.type_tag()
                ))),
            })
            .collect()
    }

    fn deserialize_batch(
        &self,
        blobs: &[Bytes],
        infos: &[ParamInfo],
        _options: &RestoreOptions,
    ) -> Result<Vec<LeafValue>> {
        blobs
            .iter()
            .zip(infos)
            .map(|(blob, info)| {
                let dtype = info.dtype.ok_or_else(|| {
                    Error::Serialization(format!("tensor {} is missing its dtype", info.name))
                })?;
                let shape = info.shape.clone().ok_or_else(|| {
                    Error::Serialization(format!("tensor {} is missing its shape", info.name))
                })?;
                let tensor = TensorData::new(dtype, shape, blob.clone());
                if tensor.data.len() != tensor.expected_len() {
                    return Err(Error::Serialization(format!(
                        "tensor {} payload is {} bytes but shape/dtype imply {}",
                        info.name,
                        tensor.data.len(),
                        tensor.expected_len()
                    )));
                }
                Ok(LeafValue::Tensor(tensor))
            })
            .collect()
    }
}

/// Codec for scalar leaves, bincode-encoded
pub struct ScalarCodec;

impl ValueCodec for ScalarCodec {
    fn type_tag(&self) -> &str {
        TAG_SCALAR
    }

    fn serialize_batch(
        &self,
        values: &[&LeafValue],
        infos: &[ParamInfo],
        _options: &SaveOptions,
    ) -> Result<Vec<Bytes>> {
        values
            .iter()
            .zip(infos)
            .map(|(value, info)| match value {
                LeafValue::Scalar(s) => {
                    let encoded = bincode::serialize(s).map_err(|e| {
                        Error::Serialization(format!("scalar {}: {}", info.name, e))
                    })?;
                    Ok(Bytes::from(encoded))
                }
                other => Err(Error::Serialization(format!(
                    "leaf {} is not a scalar (tag {})",
                    info.name,
                    other.type_tag()
                ))),
            })
            .collect()
    }

    fn deserialize_batch(
        &self,
        blobs: &[Bytes],
        infos: &[ParamInfo],
        _options: &RestoreOptions,
    ) -> Result<Vec<LeafValue>> {
        blobs
            .iter()
            .zip(infos)
            .map(|(blob, info)| {
                let scalar: Scalar = bincode::deserialize(blob).map_err(|e| {
                    Error::Serialization(format!("scalar {}: {}", info.name, e))
                })?;
                Ok(LeafValue::Scalar(scalar))
            })
            .collect()
    }
}

/// Codec for string leaves, stored as UTF-8
pub struct StrCodec;

impl ValueCodec for StrCodec {
    fn type_tag(&self) -> &str {
        TAG_STR
    }

    fn serialize_batch(
        &self,
        values: &[&LeafValue],
        infos: &[ParamInfo],
        _options: &SaveOptions,
    ) -> Result<Vec<Bytes>> {
        values
            .iter()
            .zip(infos)
            .map(|(value, info)| match value {
                LeafValue::Str(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
                other => Err(Error::Serialization(format!(
                    "leaf {} is not a string (tag {})",
                    info.name,
                    other.type_tag()
                ))),
            })
            .collect()
    }

    fn deserialize_batch(
        &self,
        blobs: &[Bytes],
        infos: &[ParamInfo],
        _options: &RestoreOptions,
    ) -> Result<Vec<LeafValue>> {
        blobs
            .iter()
            .zip(infos)
            .map(|(blob, info)| {
                let s = String::from_utf8(blob.to_vec()).map_err(|e| {
                    Error::Serialization(format!("string {}: {}", info.name, e))
                })?;
                Ok(LeafValue::Str(s))
            })
            .collect()
    }
}

/// Codec for opaque byte leaves
pub struct BytesCodec;

impl ValueCodec for BytesCodec {
    fn type_tag(&self) -> &str {
        TAG_BYTES
    }

    fn serialize_batch(
        &self,
        values: &[&LeafValue],
        infos: &[ParamInfo],
        _options: &SaveOptions,
    ) -> Result<Vec<Bytes>> {
        values
            .iter()
            .zip(infos)
            .map(|(value, info)| match value {
                LeafValue::Bytes(b) => Ok(b.clone()),
                LeafValue::Custom { data, .. } => Ok(data.clone()),
                other => Err(Error::Serialization(format!(
                    "leaf {} is not raw bytes (tag {})",
                    info.name,
                    other.type_tag()
                ))),
            })
            .collect()
    }

    fn deserialize_batch(
        &self,
        blobs: &[Bytes],
        _infos: &[ParamInfo],
        _options: &RestoreOptions,
    ) -> Result<Vec<LeafValue>> {
        Ok(blobs.iter().map(|b| LeafValue::Bytes(b.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DType;

    fn info_for(name: &str, leaf: &LeafValue) -> ParamInfo {
        ParamInfo::from_leaf(name, leaf, None)
    }

    #[test]
    fn test_tensor_codec_batch_round_trip() {
        let codec = TensorCodec;
        let a = LeafValue::Tensor(TensorData::new(
            DType::F32,
            vec![2],
            Bytes::from(vec![0u8; 8]),
        ));
        let b = LeafValue::Tensor(TensorData::new(
            DType::I64,
            vec![1, 3],
            Bytes::from(vec![1u8; 24]),
        ));
        let infos = vec![info_for("a", &a), info_for("b", &b)];
        let blobs = codec
            .serialize_batch(&[&a, &b], &infos, &SaveOptions::default())
            .unwrap();
        assert_eq!(blobs.len(), 2);

        let restored = codec
            .deserialize_batch(&blobs, &infos, &RestoreOptions::default())
            .unwrap();
        assert_eq!(restored, vec![a, b]);
    }

    #[test]
    fn test_tensor_codec_length_mismatch_names_leaf() {
        let codec = TensorCodec;
        let bad = LeafValue::Tensor(TensorData::new(
            DType::F32,
            vec![4],
            Bytes::from(vec![0u8; 3]),
        ));
        let infos = vec![info_for("params/kernel", &bad)];
        let err = codec
            .serialize_batch(&[&bad], &infos, &SaveOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("params/kernel"));
    }

    #[test]
    fn test_scalar_codec_round_trip() {
        let codec = ScalarCodec;
        let values = vec![
            LeafValue::Scalar(Scalar::F64(0.5)),
            LeafValue::Scalar(Scalar::I64(-3)),
            LeafValue::Scalar(Scalar::Bool(true)),
        ];
        let infos: Vec<ParamInfo> = values
            .iter()
            .enumerate()
            .map(|(i, v)| info_for(&format!("s{}", i), v))
            .collect();
        let refs: Vec<&LeafValue> = values.iter().collect();
        let blobs = codec
            .serialize_batch(&refs, &infos, &SaveOptions::default())
            .unwrap();
        let restored = codec
            .deserialize_batch(&blobs, &infos, &RestoreOptions::default())
            .unwrap();
        assert_eq!(restored, values);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let codec = StrCodec;
        let leaf = LeafValue::Scalar(Scalar::I64(9));
        let infos = vec![info_for("oops", &leaf)];
        let err = codec
            .serialize_batch(&[&leaf], &infos, &SaveOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(err.to_string().contains("oops"));
    }
}
