//! # Codec Chain
//!
//! Purpose: Turn caller values into stored bytes and back, while allowing the
//! storage format to migrate without invalidating existing data.
//!
//! ## Design Principles
//! 1. **Write One, Read Many**: Encoding always uses the first serializer and
//!    the first compressor; decoding tries every configured strategy in order.
//! 2. **Different Terminal Rules**: An exhausted compressor chain means "was
//!    never compressed" and passes the bytes through. An exhausted serializer
//!    chain means the value cannot be reconstructed and is a [`CodecError`].
//! 3. **Counter Friendly**: Integers bypass the chain as decimal text.
//! 4. **No I/O**: Codec work is synchronous and never suspends.
//!
//! ## Write Path
//! ```text
//! value ─► integer? ──yes──► "123"
//!            │no
//!            ▼
//!      serializers[0] ─► len > min_compress_len? ──yes──► compressors[0]
//! ```

mod compressor;
mod integer;
mod serializer;

use std::borrow::Cow;

use ckv_common::{CacheError, CacheOptions, CacheResult, CodecError, CompressorKind, SerializerKind};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use compressor::{compressor_for, Compressor, Gzip, Identity, Lz4, Zlib};
pub use serializer::Serializer;

/// Ordered serializer and compressor chains.
pub struct CodecChain {
    serializers: Vec<Serializer>,
    compressors: Vec<Box<dyn Compressor>>,
    min_compress_len: usize,
    strict_compression: bool,
}

impl CodecChain {
    /// Builds the chain described by the options.
    pub fn from_options(options: &CacheOptions) -> CacheResult<Self> {
        Self::new(
            &options.serializers,
            &options.compressors,
            options.min_compress_len,
            options.strict_compression,
        )
    }

    /// Builds a chain. An empty serializer list is a configuration error.
    pub fn new(
        serializers: &[SerializerKind],
        compressors: &[CompressorKind],
        min_compress_len: usize,
        strict_compression: bool,
    ) -> CacheResult<Self> {
        if serializers.is_empty() {
            return Err(CacheError::Config(
                "serializer chain must contain at least one serializer".into(),
            ));
        }
        Ok(CodecChain {
            serializers: serializers.iter().copied().map(Serializer::new).collect(),
            compressors: compressors.iter().copied().map(compressor_for).collect(),
            min_compress_len,
            strict_compression,
        })
    }

    /// JSON only, no compression.
    pub fn json() -> Self {
        CodecChain {
            serializers: vec![Serializer::new(SerializerKind::Json)],
            compressors: Vec::new(),
            min_compress_len: 256,
            strict_compression: false,
        }
    }

    /// Encodes with the authoritative (first) strategies.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        if let Some(digits) = integer::as_integer(value) {
            return Ok(digits);
        }
        let serializer = &self.serializers[0];
        let raw = serializer
            .serialize(value)
            .map_err(|e| CodecError::Serialize(format!("{}: {e}", serializer.name())))?;

        match self.compressors.first() {
            Some(compressor) if raw.len() > self.min_compress_len => compressor
                .compress(&raw)
                .map_err(|e| CodecError::Compress(format!("{}: {e}", compressor.name())).into()),
            _ => Ok(raw),
        }
    }

    /// Decodes by trying every strategy in order.
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> CacheResult<T> {
        if let Some(value) = integer::decode_integer(data) {
            return Ok(value);
        }
        let payload = self.decompress(data)?;
        self.deserialize(&payload)
    }

    /// Runs only the compressor chain, passing unknown bytes through.
    pub fn decompress<'a>(&self, data: &'a [u8]) -> CacheResult<Cow<'a, [u8]>> {
        for compressor in &self.compressors {
            if let Ok(out) = compressor.decompress(data) {
                return Ok(Cow::Owned(out));
            }
        }
        // Payloads at or below the threshold were never compressed, so
        // strict mode only objects to longer ones.
        if self.strict_compression && !self.compressors.is_empty() && data.len() > self.min_compress_len {
            return Err(CodecError::Decompress.into());
        }
        Ok(Cow::Borrowed(data))
    }

    fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> CacheResult<T> {
        let mut failures = Vec::with_capacity(self.serializers.len());
        for serializer in &self.serializers {
            match serializer.deserialize(data) {
                Ok(value) => return Ok(value),
                Err(err) => failures.push(format!("{}: {err}", serializer.name())),
            }
        }
        Err(CodecError::Deserialize(failures.join("; ")).into())
    }

    pub fn min_compress_len(&self) -> usize {
        self.min_compress_len
    }
}

impl std::fmt::Debug for CodecChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecChain")
            .field("serializers", &self.serializers.iter().map(Serializer::name).collect::<Vec<_>>())
            .field("compressors", &self.compressors.iter().map(|c| c.name()).collect::<Vec<_>>())
            .field("min_compress_len", &self.min_compress_len)
            .field("strict_compression", &self.strict_compression)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckv_common::ErrorKind;
    use proptest::prelude::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        tags: Vec<String>,
        score: f64,
    }

    fn chain(serializers: &[SerializerKind], compressors: &[CompressorKind]) -> CodecChain {
        CodecChain::new(serializers, compressors, 256, false).unwrap()
    }

    #[test]
    fn json_without_compression_roundtrip() {
        let codec = chain(&[SerializerKind::Json], &[]);
        let bytes = codec.encode(&json!({"a": 1})).unwrap();
        assert_eq!(bytes, br#"{"a":1}"#);
        let back: serde_json::Value = codec.decode(&bytes).unwrap();
        assert_eq!(back, json!({"a": 1}));
    }

    #[test]
    fn empty_serializer_chain_is_config_error() {
        let err = CodecChain::new(&[], &[CompressorKind::Zlib], 256, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn small_payloads_are_not_compressed() {
        let codec = chain(&[SerializerKind::Json], &[CompressorKind::Zlib]);
        let bytes = codec.encode("short").unwrap();
        assert_eq!(bytes, br#""short""#);
    }

    #[test]
    fn threshold_is_exclusive() {
        let codec = CodecChain::new(&[SerializerKind::Json], &[CompressorKind::Gzip], 7, false).unwrap();
        // `"hello"` is exactly 7 bytes.
        assert_eq!(codec.encode("hello").unwrap(), br#""hello""#);
        assert_ne!(codec.encode("hello!").unwrap(), br#""hello!""#);
    }

    #[test]
    fn large_payloads_use_first_compressor() {
        let codec = chain(&[SerializerKind::Json], &[CompressorKind::Gzip, CompressorKind::Zlib]);
        let text = "x".repeat(1000);
        let bytes = codec.encode(&text).unwrap();
        assert!(bytes.len() < 100);
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        let back: String = codec.decode(&bytes).unwrap();
        assert_eq!(back, text);
    }

    #[test]
    fn uncompressed_legacy_bytes_pass_through() {
        let codec = chain(&[SerializerKind::Json], &[CompressorKind::Zlib, CompressorKind::Lz4]);
        let legacy = serde_json::to_vec(&json!({"legacy": true, "pad": "y".repeat(400)})).unwrap();
        let back: serde_json::Value = codec.decode(&legacy).unwrap();
        assert_eq!(back["legacy"], json!(true));
    }

    #[test]
    fn strict_compression_rejects_unknown_large_payloads() {
        let codec = CodecChain::new(&[SerializerKind::Json], &[CompressorKind::Zlib], 16, true).unwrap();
        let small = br#""tiny""#;
        assert_eq!(codec.decode::<String>(small).unwrap(), "tiny");
        let large = serde_json::to_vec(&"z".repeat(64)).unwrap();
        let err = codec.decode::<String>(&large).unwrap_err();
        assert!(matches!(err, CacheError::Codec(CodecError::Decompress)));
    }

    #[test]
    fn falls_back_to_older_serializer() {
        let old = chain(&[SerializerKind::Json], &[]);
        let new = chain(&[SerializerKind::MessagePack, SerializerKind::Json], &[]);
        let profile = Profile {
            name: "ada".into(),
            tags: vec!["math".into()],
            score: 9.5,
        };

        let legacy = old.encode(&profile).unwrap();
        let decoded: Profile = new.decode(&legacy).unwrap();
        assert_eq!(decoded, profile);

        let fresh = new.encode(&profile).unwrap();
        assert_eq!(fresh, rmp_serde::to_vec_named(&profile).unwrap());
        assert!(old.decode::<Profile>(&fresh).is_err());
    }

    #[test]
    fn exhausted_serializer_chain_is_codec_error() {
        let codec = chain(&[SerializerKind::Json], &[]);
        let err = codec.decode::<Profile>(b"\xff\xfe not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Codec);
    }

    #[test]
    fn integers_bypass_serializers_and_compressors() {
        let codec = CodecChain::new(&[SerializerKind::MessagePack], &[CompressorKind::Gzip], 0, false).unwrap();
        assert_eq!(codec.encode(&12345u32).unwrap(), b"12345");
        assert_eq!(codec.decode::<i64>(b"12345").unwrap(), 12345);
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            map in proptest::collection::btree_map("[a-z]{1,8}", any::<i32>(), 0..20),
            text in ".{0,600}",
            msgpack in any::<bool>(),
            compress in any::<bool>(),
        ) {
            let serializer = if msgpack { SerializerKind::MessagePack } else { SerializerKind::Json };
            let compressors = if compress { vec![CompressorKind::Zlib] } else { Vec::new() };
            let codec = CodecChain::new(&[serializer], &compressors, 64, false).unwrap();

            let bytes = codec.encode(&map).unwrap();
            let back: BTreeMap<String, i32> = codec.decode(&bytes).unwrap();
            prop_assert_eq!(back, map);

            let bytes = codec.encode(&text).unwrap();
            let back: String = codec.decode(&bytes).unwrap();
            prop_assert_eq!(back, text);
        }
    }
}
