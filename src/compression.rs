//! LZ4 framing for stored blobs
//!
//! Every blob written by the [`ContentStore`](crate::store::ContentStore) is
//! framed with a 4-byte header so the reader knows whether the payload was
//! compressed:
//!
//! - `LZ4R`: LZ4 block with a prepended uncompressed size follows
//! - `\0\0\0\0`: raw bytes follow
//!
//! The framing is a storage detail only. Blob hashes are always computed over
//! the *uncompressed* content, so changing the strategy never changes a hash
//! and two stores with different strategies still agree on every key.
//!
//! ## Strategies
//!
//! - **None**: store everything raw
//! - **Fast**: LZ4 for anything large enough to benefit (default)
//! - **Adaptive**: LZ4 above a size threshold, skipping formats that are
//!   already compressed
//!
//! ```rust
//! use rewind::compression::{BlobCodec, CompressionStrategy};
//! use std::path::Path;
//!
//! let codec = BlobCodec::new(CompressionStrategy::Fast);
//! let data = b"fn main() {}\n".repeat(64);
//! let framed = codec.encode(Some(Path::new("main.rs")), &data);
//! assert!(framed.len() < data.len());
//! assert_eq!(codec.decode(&framed).unwrap(), data);
//! ```

use crate::error::{Result, RewindError};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Header for LZ4-compressed payloads
const LZ4_MAGIC: &[u8; 4] = b"LZ4R";

/// Header for raw payloads
const RAW_MAGIC: &[u8; 4] = &[0, 0, 0, 0];

/// Payloads below this size are never worth an LZ4 attempt
const MIN_COMPRESS_SIZE: usize = 64;

/// When to compress blob payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionStrategy {
    /// Store every blob raw
    None,
    /// LZ4 for every blob that shrinks
    #[default]
    Fast,
    /// LZ4 above `min_size`, skipping known compressed formats
    Adaptive {
        /// Skip compression for blobs smaller than this
        min_size: usize,
        /// File extensions (lowercase, no dot) that are stored raw
        skip_extensions: Vec<String>,
    },
}

impl CompressionStrategy {
    /// Adaptive strategy with a 4 KiB floor and the default skip list
    pub fn adaptive() -> Self {
        CompressionStrategy::Adaptive {
            min_size: 4096,
            skip_extensions: default_skip_extensions(),
        }
    }
}

/// Extensions of formats that LZ4 will not shrink
pub fn default_skip_extensions() -> Vec<String> {
    [
        "jpg", "jpeg", "png", "gif", "webp", "mp3", "mp4", "mov", "zip", "gz", "xz", "bz2",
        "7z", "zst", "rar", "pdf", "woff", "woff2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Snapshot of codec counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionStats {
    /// Blobs stored with LZ4
    pub blobs_compressed: u64,
    /// Blobs stored raw
    pub blobs_stored_raw: u64,
    /// Bytes saved by compression
    pub bytes_saved: u64,
}

impl CompressionStats {
    /// Fraction of encoded blobs that were compressed
    pub fn compression_ratio(&self) -> f64 {
        let total = self.blobs_compressed + self.blobs_stored_raw;
        if total == 0 {
            return 0.0;
        }
        self.blobs_compressed as f64 / total as f64
    }
}

/// Encoder/decoder for blob framing
///
/// Shared by every capture running against a store, so counters are atomic
/// and all methods take `&self`.
#[derive(Debug, Default)]
pub struct BlobCodec {
    strategy: CompressionStrategy,
    compressed: AtomicU64,
    raw: AtomicU64,
    saved: AtomicU64,
}

impl BlobCodec {
    /// Create a codec for the given strategy
    pub fn new(strategy: CompressionStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Strategy this codec applies
    pub fn strategy(&self) -> &CompressionStrategy {
        &self.strategy
    }

    /// Current counters
    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            blobs_compressed: self.compressed.load(Ordering::Relaxed),
            blobs_stored_raw: self.raw.load(Ordering::Relaxed),
            bytes_saved: self.saved.load(Ordering::Relaxed),
        }
    }

    /// Frame `content` for storage
    ///
    /// # Arguments
    ///
    /// * `hint` - Path the content was read from, used by the adaptive strategy
    /// * `content` - Uncompressed bytes
    ///
    /// # Returns
    ///
    /// The header followed by either the LZ4 block or the raw bytes. LZ4 is
    /// only kept when it actually shrinks the payload.
    pub fn encode(&self, hint: Option<&Path>, content: &[u8]) -> Vec<u8> {
        if self.should_compress(hint, content.len()) {
            let compressed = compress_prepend_size(content);
            if compressed.len() < content.len() {
                let saved = (content.len() - compressed.len()) as u64;
                self.compressed.fetch_add(1, Ordering::Relaxed);
                self.saved.fetch_add(saved, Ordering::Relaxed);
                trace!(
                    "Compressed {:?}: {} -> {} bytes",
                    hint,
                    content.len(),
                    compressed.len()
                );
                let mut framed = Vec::with_capacity(LZ4_MAGIC.len() + compressed.len());
                framed.extend_from_slice(LZ4_MAGIC);
                framed.extend_from_slice(&compressed);
                return framed;
            }
        }

        self.raw.fetch_add(1, Ordering::Relaxed);
        let mut framed = Vec::with_capacity(RAW_MAGIC.len() + content.len());
        framed.extend_from_slice(RAW_MAGIC);
        framed.extend_from_slice(content);
        framed
    }

    /// Strip the framing and decompress if needed
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::Decompression`] for a short or unknown header,
    /// or an LZ4 block that fails to decode.
    pub fn decode(&self, framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < 4 {
            return Err(RewindError::Decompression(format!(
                "framed blob too short ({} bytes)",
                framed.len()
            )));
        }

        let (header, payload) = framed.split_at(4);
        if header == LZ4_MAGIC {
            decompress_size_prepended(payload)
                .map_err(|e| RewindError::Decompression(format!("LZ4 decompression failed: {}", e)))
        } else if header == RAW_MAGIC {
            Ok(payload.to_vec())
        } else {
            Err(RewindError::Decompression(format!(
                "unknown blob header {:02x?}",
                header
            )))
        }
    }

    fn should_compress(&self, hint: Option<&Path>, size: usize) -> bool {
        if size < MIN_COMPRESS_SIZE {
            return false;
        }
        match &self.strategy {
            CompressionStrategy::None => false,
            CompressionStrategy::Fast => true,
            CompressionStrategy::Adaptive {
                min_size,
                skip_extensions,
            } => {
                if size < *min_size {
                    return false;
                }
                let ext = hint
                    .and_then(|p| p.extension())
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase());
                match ext {
                    Some(ext) => !skip_extensions.iter().any(|s| s == &ext),
                    None => true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_compresses_repetitive_text() {
        let codec = BlobCodec::new(CompressionStrategy::Fast);
        let data = b"let x = 1;\n".repeat(200);
        let framed = codec.encode(Some(Path::new("lib.rs")), &data);
        assert_eq!(&framed[..4], LZ4_MAGIC);
        assert_eq!(codec.decode(&framed).unwrap(), data);
        assert_eq!(codec.stats().blobs_compressed, 1);
        assert!(codec.stats().bytes_saved > 0);
    }

    #[test]
    fn test_small_and_none_are_raw() {
        let codec = BlobCodec::new(CompressionStrategy::Fast);
        let framed = codec.encode(None, b"tiny");
        assert_eq!(&framed[..4], RAW_MAGIC);

        let codec = BlobCodec::new(CompressionStrategy::None);
        let data = vec![b'a'; 10_000];
        let framed = codec.encode(None, &data);
        assert_eq!(framed.len(), data.len() + 4);
        assert_eq!(codec.decode(&framed).unwrap(), data);
    }

    #[test]
    fn test_adaptive_skips_extensions() {
        let codec = BlobCodec::new(CompressionStrategy::adaptive());
        let data = vec![0u8; 8192];
        let framed = codec.encode(Some(Path::new("photo.PNG")), &data);
        assert_eq!(&framed[..4], RAW_MAGIC);

        let framed = codec.encode(Some(Path::new("data.bin")), &data);
        assert_eq!(&framed[..4], LZ4_MAGIC);
    }

    #[test]
    fn test_incompressible_falls_back_to_raw() {
        let codec = BlobCodec::new(CompressionStrategy::Fast);
        let data: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let framed = codec.encode(None, &data);
        assert_eq!(codec.decode(&framed).unwrap(), data);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = BlobCodec::default();
        assert!(codec.decode(b"ab").is_err());
        assert!(codec.decode(b"XXXXpayload").is_err());
        assert!(codec.decode(b"LZ4Rnot-lz4").is_err());
    }
}
