//! Opaque payload codec
//!
//! Step parameters, adviser parameters and bus payloads cross the engine as
//! bytes keyed by a type tag. The engine never looks inside them except
//! through a [`Codec`], so the wire format can be swapped without touching
//! orchestration logic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Encodes tagged documents to bytes and back.
pub trait Codec: Send + Sync {
    fn encode_bytes(&self, tag: &str, value: &Value) -> Result<Vec<u8>>;

    /// Fails with `InvalidArguments` if the bytes carry a different tag.
    fn decode_bytes(&self, tag: &str, bytes: &[u8]) -> Result<Value>;
}

/// Encode any serializable value under `tag`.
pub fn encode<T: Serialize>(codec: &dyn Codec, tag: &str, value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    codec.encode_bytes(tag, &value)
}

/// Decode bytes produced by [`encode`] with the same tag.
pub fn decode<T: DeserializeOwned>(codec: &dyn Codec, tag: &str, bytes: &[u8]) -> Result<T> {
    let value = codec.decode_bytes(tag, bytes)?;
    Ok(serde_json::from_value(value)?)
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    tag: String,
    body: Value,
}

/// JSON envelope `{"tag": .., "body": ..}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_bytes(&self, tag: &str, value: &Value) -> Result<Vec<u8>> {
        let envelope = Envelope {
            tag: tag.to_string(),
            body: value.clone(),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn decode_bytes(&self, tag: &str, bytes: &[u8]) -> Result<Value> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.tag != tag {
            return Err(EngineError::invalid(format!(
                "payload tagged '{}' decoded as '{}'",
                envelope.tag, tag
            )));
        }
        Ok(envelope.body)
    }
}

/// Wraps another codec and zstd-compresses its output.
#[derive(Debug, Clone)]
pub struct ZstdCodec<C> {
    inner: C,
    level: i32,
}

impl<C: Codec> ZstdCodec<C> {
    pub fn new(inner: C, level: i32) -> Self {
        Self { inner, level }
    }
}

impl<C: Codec> Codec for ZstdCodec<C> {
    fn encode_bytes(&self, tag: &str, value: &Value) -> Result<Vec<u8>> {
        let raw = self.inner.encode_bytes(tag, value)?;
        zstd::encode_all(&raw[..], self.level).map_err(|e| EngineError::Compression(e.to_string()))
    }

    fn decode_bytes(&self, tag: &str, bytes: &[u8]) -> Result<Value> {
        let raw = zstd::decode_all(bytes).map_err(|e| EngineError::Compression(e.to_string()))?;
        self.inner.decode_bytes(tag, &raw)
    }
}
