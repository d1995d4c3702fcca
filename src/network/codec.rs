// Codec registry.
//
// Each connector protocol owns one codec. Stateless codecs are shared
// process-wide; stateful codecs are created per connection from their
// factory. Payload codecs translate between typed messages and the raw
// payload bytes carried inside data frames.

use crate::error::{ClusterError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Transforms raw payload bytes on their way through a connection.
pub trait RawCodec: Send + Sync {
    fn encode(&mut self, payload: &[u8]) -> Result<Bytes>;
    fn decode(&mut self, payload: Bytes) -> Result<Bytes>;
}

/// Creates codec instances for connections of one protocol.
pub trait CodecFactory: Send + Sync {
    fn base_name(&self) -> &str;

    /// Stateful codecs get a fresh instance per connection; stateless ones
    /// may be shared.
    fn is_stateful(&self) -> bool;

    fn create(&self) -> Box<dyn RawCodec>;
}

/// Pass-through codec; the default for every connector.
pub struct IdentityCodec;

impl RawCodec for IdentityCodec {
    fn encode(&mut self, payload: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(payload))
    }

    fn decode(&mut self, payload: Bytes) -> Result<Bytes> {
        Ok(payload)
    }
}

pub struct IdentityCodecFactory;

impl CodecFactory for IdentityCodecFactory {
    fn base_name(&self) -> &str {
        "identity"
    }

    fn is_stateful(&self) -> bool {
        false
    }

    fn create(&self) -> Box<dyn RawCodec> {
        Box::new(IdentityCodec)
    }
}

/// Maps protocol identifiers to codec factories.
#[derive(Default)]
pub struct CodecRegistry {
    factories: RwLock<HashMap<String, Arc<dyn CodecFactory>>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, protocol: impl Into<String>, factory: Arc<dyn CodecFactory>) -> Result<()> {
        let protocol = protocol.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&protocol) {
            return Err(ClusterError::Configuration(format!(
                "duplicate codec for protocol: {}",
                protocol
            )));
        }
        factories.insert(protocol, factory);
        Ok(())
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn CodecFactory>> {
        self.factories.read().get(protocol).cloned()
    }
}

/// Typed payload codec applied at the channel boundary.
pub trait MessageCodec<T>: Send + Sync {
    fn encode(&self, msg: &T) -> Result<Bytes>;
    fn decode(&self, payload: Bytes) -> Result<T>;
}

/// Raw bytes in, raw bytes out.
pub struct BytesMessageCodec;

impl MessageCodec<Bytes> for BytesMessageCodec {
    fn encode(&self, msg: &Bytes) -> Result<Bytes> {
        Ok(msg.clone())
    }

    fn decode(&self, payload: Bytes) -> Result<Bytes> {
        Ok(payload)
    }
}

/// JSON payload codec for any serde type.
pub struct JsonMessageCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonMessageCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonMessageCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageCodec<T> for JsonMessageCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, msg: &T) -> Result<Bytes> {
        let vec = serde_json::to_vec(msg)
            .map_err(|e| ClusterError::Codec(format!("JSON encode failed: {}", e)))?;
        Ok(Bytes::from(vec))
    }

    fn decode(&self, payload: Bytes) -> Result<T> {
        serde_json::from_slice(&payload)
            .map_err(|e| ClusterError::Codec(format!("JSON decode failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_duplicate_protocol_rejected() {
        let registry = CodecRegistry::new();
        registry
            .register("gossip", Arc::new(IdentityCodecFactory))
            .unwrap();
        let err = registry
            .register("gossip", Arc::new(IdentityCodecFactory))
            .unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
    }

    #[test]
    fn test_lookup() {
        let registry = CodecRegistry::new();
        registry
            .register("locks", Arc::new(IdentityCodecFactory))
            .unwrap();
        assert!(registry.get("locks").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_identity_codec() {
        let mut codec = IdentityCodecFactory.create();
        let encoded = codec.encode(b"abc").unwrap();
        assert_eq!(encoded.as_ref(), b"abc");
        let decoded = codec.decode(encoded).unwrap();
        assert_eq!(decoded.as_ref(), b"abc");
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u32,
        name: String,
    }

    #[test]
    fn test_json_codec_round_trip() {
        let codec = JsonMessageCodec::<Job>::new();
        let job = Job {
            id: 9,
            name: "rebalance".into(),
        };
        let bytes = codec.encode(&job).unwrap();
        let back = codec.decode(bytes).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_json_codec_decode_error() {
        let codec = JsonMessageCodec::<Job>::new();
        let err = codec.decode(Bytes::from_static(b"not json")).unwrap_err();
        assert!(matches!(err, ClusterError::Codec(_)));
    }
}
