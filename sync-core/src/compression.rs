//! Conditional payload compression and duplicate-context suppression.
//!
//! Payloads above a size threshold are zstd-compressed. Results are cached by
//! blake3 content hash in a small LRU so byte-identical inputs (periodic
//! standings, repeated course data) are only compressed once.
//!
//! [`ContextDeduper`] is the separate full-state channel check: a context
//! snapshot identical to the last one successfully sent for its namespace is
//! suppressed entirely.

use std::collections::{HashMap, VecDeque};

use linkwise_sync_types::Namespace;

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level.
pub const DEFAULT_LEVEL: i32 = 3;

/// Payloads at or below this size are sent raw.
pub const DEFAULT_THRESHOLD: usize = 1024;

/// Default number of cached compression results.
pub const DEFAULT_CACHE_ENTRIES: usize = 50;

/// Compression error types
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// Failed to compress data
    #[error("compression failed: {0}")]
    CompressFailed(String),

    /// Failed to decompress data
    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    /// Payload is flagged compressed but lacks the zstd header
    #[error("payload is not zstd data")]
    NotCompressed,
}

/// Check if data is zstd-compressed by checking magic bytes.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Output of [`PayloadCompressor::compress_if_beneficial`].
#[derive(Clone, PartialEq, Eq)]
pub struct CompressedPayload {
    /// Bytes to put on the wire.
    pub bytes: Vec<u8>,
    /// Whether `bytes` is compressed.
    pub compressed: bool,
}

impl std::fmt::Debug for CompressedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedPayload")
            .field("bytes", &format!("[{} bytes REDACTED]", self.bytes.len()))
            .field("compressed", &self.compressed)
            .finish()
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    /// Inputs served from the cache.
    pub hits: u64,
    /// Inputs that had to be compressed.
    pub misses: u64,
    /// Inputs below the threshold.
    pub skipped: u64,
}

/// Small hash-keyed LRU. `None` records that compression did not help.
#[derive(Debug)]
struct LruCache {
    entries: HashMap<blake3::Hash, Option<Vec<u8>>>,
    order: VecDeque<blake3::Hash>,
    capacity: usize,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn get(&mut self, key: &blake3::Hash) -> Option<Option<Vec<u8>>> {
        let value = self.entries.get(key)?.clone();
        self.touch(key);
        Some(value)
    }

    fn put(&mut self, key: blake3::Hash, value: Option<Vec<u8>>) {
        if self.entries.insert(key, value).is_some() {
            self.touch(&key);
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn touch(&mut self, key: &blake3::Hash) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(*key);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Compresses payloads above a threshold, caching results by content hash.
#[derive(Debug)]
pub struct PayloadCompressor {
    threshold: usize,
    level: i32,
    cache: LruCache,
    stats: CompressionStats,
}

impl PayloadCompressor {
    /// Create a compressor.
    pub fn new(threshold: usize, cache_entries: usize, level: i32) -> Self {
        Self {
            threshold,
            level,
            cache: LruCache::new(cache_entries),
            stats: CompressionStats::default(),
        }
    }

    /// Compress `raw` if it exceeds the threshold and compression shrinks it.
    pub fn compress_if_beneficial(
        &mut self,
        raw: &[u8],
    ) -> Result<CompressedPayload, CompressionError> {
        if raw.len() <= self.threshold {
            self.stats.skipped += 1;
            return Ok(raw_payload(raw));
        }

        let hash = blake3::hash(raw);
        if let Some(cached) = self.cache.get(&hash) {
            self.stats.hits += 1;
            return Ok(match cached {
                Some(bytes) => CompressedPayload {
                    bytes,
                    compressed: true,
                },
                None => raw_payload(raw),
            });
        }

        self.stats.misses += 1;
        let compressed = zstd::encode_all(raw, self.level)
            .map_err(|e| CompressionError::CompressFailed(e.to_string()))?;

        if compressed.len() < raw.len() {
            self.cache.put(hash, Some(compressed.clone()));
            Ok(CompressedPayload {
                bytes: compressed,
                compressed: true,
            })
        } else {
            self.cache.put(hash, None);
            Ok(raw_payload(raw))
        }
    }

    /// Cache counters.
    pub fn stats(&self) -> CompressionStats {
        self.stats
    }

    /// Number of cached results.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Size threshold in bytes.
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl Default for PayloadCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_CACHE_ENTRIES, DEFAULT_LEVEL)
    }
}

fn raw_payload(raw: &[u8]) -> CompressedPayload {
    CompressedPayload {
        bytes: raw.to_vec(),
        compressed: false,
    }
}

/// Decompress a payload produced by [`PayloadCompressor`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if !is_compressed(data) {
        return Err(CompressionError::NotCompressed);
    }
    zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
}

/// Suppresses full-state context pushes identical to the last one sent.
#[derive(Debug, Default)]
pub struct ContextDeduper {
    last_sent: HashMap<Namespace, blake3::Hash>,
}

impl ContextDeduper {
    /// Create an empty deduper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `context` differs from the last context sent for `namespace`.
    pub fn should_send(&self, namespace: &Namespace, context: &[u8]) -> bool {
        self.last_sent
            .get(namespace)
            .map_or(true, |last| *last != blake3::hash(context))
    }

    /// Record a successful send. Call only after the transport accepted it.
    pub fn mark_sent(&mut self, namespace: Namespace, context: &[u8]) -> blake3::Hash {
        let hash = blake3::hash(context);
        self.last_sent.insert(namespace, hash);
        hash
    }

    /// Forget a namespace (context switch).
    pub fn forget(&mut self, namespace: &Namespace) {
        self.last_sent.remove(namespace);
    }
}
