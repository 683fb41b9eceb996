//! Serializer strategies.
//!
//! Serializers are generic over the value type, so they are dispatched by
//! enum rather than through trait objects.

use ckv_common::SerializerKind;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One serializer of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Serializer {
    kind: SerializerKind,
}

impl Serializer {
    pub fn new(kind: SerializerKind) -> Self {
        Serializer { kind }
    }

    pub fn kind(&self) -> SerializerKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            SerializerKind::Json => "json",
            SerializerKind::MessagePack => "msgpack",
        }
    }

    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, String> {
        match self.kind {
            SerializerKind::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            // Named encoding keeps struct fields readable across versions.
            SerializerKind::MessagePack => rmp_serde::to_vec_named(value).map_err(|e| e.to_string()),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, String> {
        match self.kind {
            SerializerKind::Json => serde_json::from_slice(data).map_err(|e| e.to_string()),
            SerializerKind::MessagePack => rmp_serde::from_slice(data).map_err(|e| e.to_string()),
        }
    }
}
