//! Compressor strategies.

use std::io::{self, Read, Write};

use ckv_common::CompressorKind;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

/// A byte-level compression strategy.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &'static str;
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
    /// Fails when `data` is not something this compressor produced.
    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// Builds the strategy for a configured identifier.
pub fn compressor_for(kind: CompressorKind) -> Box<dyn Compressor> {
    match kind {
        CompressorKind::Gzip => Box::new(Gzip),
        CompressorKind::Zlib => Box::new(Zlib),
        CompressorKind::Lz4 => Box::new(Lz4),
        CompressorKind::Identity => Box::new(Identity),
    }
}

pub struct Gzip;

impl Compressor for Gzip {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2);
        GzDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

pub struct Zlib;

impl Compressor for Zlib {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2);
        ZlibDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// LZ4 block format with a little-endian u32 size prefix.
pub struct Lz4;

// LZ4 cannot expand more than ~255x; larger declared sizes mean the input
// was never LZ4 and must not drive an allocation.
const LZ4_MAX_RATIO: usize = 255;

impl Compressor for Lz4 {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);
        let (size, block) = lz4_flex::block::uncompressed_size(data).map_err(|e| invalid(e.to_string()))?;
        if size > block.len().saturating_mul(LZ4_MAX_RATIO) + 16 {
            return Err(invalid(format!("implausible lz4 size {size}")));
        }
        lz4_flex::block::decompress(block, size).map_err(|e| invalid(e.to_string()))
    }
}

/// Stores bytes unchanged. Accepts any input on decompress.
pub struct Identity;

impl Compressor for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        br#"{"payload":"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"}"#.repeat(8)
    }

    #[test]
    fn compressors_restore_input() {
        for kind in [
            CompressorKind::Gzip,
            CompressorKind::Zlib,
            CompressorKind::Lz4,
            CompressorKind::Identity,
        ] {
            let c = compressor_for(kind);
            let packed = c.compress(&sample()).unwrap();
            assert_eq!(c.decompress(&packed).unwrap(), sample(), "{}", c.name());
        }
    }

    #[test]
    fn real_compressors_reject_plain_json() {
        let plain = br#"{"a": 1, "b": [1, 2, 3]}"#;
        for kind in [CompressorKind::Gzip, CompressorKind::Zlib, CompressorKind::Lz4] {
            assert!(compressor_for(kind).decompress(plain).is_err());
        }
    }

    #[test]
    fn lz4_rejects_absurd_size_prefix() {
        let mut data = u32::MAX.to_le_bytes().to_vec();
        data.extend_from_slice(b"tiny");
        assert!(Lz4.decompress(&data).is_err());
    }
}
