/*!
Compression adapters for stored snapshot payloads.

The flat-file backend gzips every document; the trait keeps the algorithm
swappable, and [`NoCompression`] lets tests look at raw payloads.
*/

use crate::{Result, StoreError};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

/// Compression abstraction for snapshot payloads
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use stathive_core::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let data = br#"{"name":"root","count":3}"#;
/// let compressed = compressor.compress(data)?;
/// assert_eq!(compressor.decompress(&compressed)?, data);
/// # Ok::<(), stathive_core::StoreError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Gzip with the default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Gzip with an explicit level, 0 (store) to 9 (best); larger values are clamped
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    pub fn level(&self) -> u32 {
        self.compression_level.level()
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder
            .write_all(data)
            .map_err(|e| StoreError::compression(format!("Failed to write data for compression: {e}")))?;

        encoder
            .finish()
            .map_err(|e| StoreError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| StoreError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Pass-through adapter
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_shrinks_repetitive_trees() {
        let compressor = GzipCompressor::new();
        let node = r#"{"name":"GET /api/orders","count":12,"error_count":0},"#;
        let original = node.repeat(50).into_bytes();

        let compressed = compressor.compress(&original).unwrap();
        assert!(compressed.len() < original.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), original);
    }

    #[test]
    fn test_gzip_level_is_clamped() {
        assert_eq!(GzipCompressor::with_level(42).level(), 9);
        assert_eq!(GzipCompressor::with_level(1).level(), 1);
    }

    #[test]
    fn test_gzip_empty_data() {
        let compressor = GzipCompressor::new();
        let compressed = compressor.compress(b"").unwrap();
        assert!(compressor.decompress(&compressed).unwrap().is_empty());
    }

    #[test]
    fn test_gzip_invalid_compressed_data() {
        let compressor = GzipCompressor::new();
        let result = compressor.decompress(b"this is not compressed gzip data");
        assert!(matches!(result, Err(StoreError::Compression(_))));
    }

    #[test]
    fn test_no_compression_passes_through() {
        let compressor = NoCompression::new();
        assert_eq!(compressor.compress(b"abc").unwrap(), b"abc");
        assert_eq!(compressor.decompress(b"abc").unwrap(), b"abc");
        assert_eq!(compressor.algorithm_name(), "none");
    }
}
