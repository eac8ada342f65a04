//! Pluggable payload codecs for the persistent tier

use crate::error::{CacheError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Byte-level transform applied to persisted payloads
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Identity codec
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCodec;

impl Codec for NoopCodec {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Gzip via flate2. Payloads below `threshold` bytes are passed through.
#[derive(Debug, Clone, Copy)]
pub struct GzipCodec {
    level: u32,
    threshold: usize,
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self {
            level: 6,
            threshold: 1024,
        }
    }
}

impl GzipCodec {
    pub fn new(level: u32, threshold: usize) -> Self {
        Self {
            level: level.min(9),
            threshold,
        }
    }

    /// Gzip streams start with the 0x1f 0x8b magic
    fn is_gzip(data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
    }
}

impl Codec for GzipCodec {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < self.threshold {
            return Ok(data.to_vec());
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| CacheError::Compression(format!("Compression failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| CacheError::Compression(format!("Compression finalization failed: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !Self::is_gzip(data) {
            return Ok(data.to_vec());
        }

        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| CacheError::Compression(format!("Decompression failed: {}", e)))?;
        Ok(decompressed)
    }
}
