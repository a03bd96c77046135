//! Bounded LRU cache of static file payloads keyed by `(encoding, path)`.
//!
//! Lookups take the read lock and check freshness against the caller's current stat;
//! the recency bump is best effort through `try_write`. Fills take the write lock and
//! re-check so concurrent misses keep only the first fresh entry.
use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;

/// Content encoding of a cached payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Identity,
    Gzip,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub encoding: Encoding,
    pub path: PathBuf,
}

impl CacheKey {
    pub fn new(encoding: Encoding, path: impl Into<PathBuf>) -> Self {
        Self {
            encoding,
            path: path.into(),
        }
    }
}

/// Cached payload plus the stat it was computed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub data: Bytes,
    pub modified: SystemTime,
    /// Size of the source file
    pub original_size: u64,
    /// Size of `data`, which differs from `original_size` for compressed entries
    pub size: u64,
    pub encoding: Encoding,
}

impl CacheEntry {
    pub fn new(data: Bytes, modified: SystemTime, original_size: u64, encoding: Encoding) -> Self {
        let size = data.len() as u64;
        Self {
            data,
            modified,
            original_size,
            size,
            encoding,
        }
    }

    /// An entry is usable only while the source mtime and size are unchanged
    pub fn is_fresh(&self, modified: SystemTime, original_size: u64) -> bool {
        self.modified == modified && self.original_size == original_size
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fills: u64,
    pub entries: usize,
}

pub struct StaticCache {
    entries: RwLock<LruCache<CacheKey, Arc<CacheEntry>>>,
    max_file_size: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    fills: AtomicU64,
}

impl StaticCache {
    pub fn new(max_entries: usize, max_file_size: u64) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            max_file_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fills: AtomicU64::new(0),
        }
    }

    /// Per-file size limit; larger files bypass the cache
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Fresh entry for `key`, or `None` when absent or stale
    pub fn lookup(
        &self,
        key: &CacheKey,
        modified: SystemTime,
        original_size: u64,
    ) -> Option<Arc<CacheEntry>> {
        let found = {
            let entries = match self.entries.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries
                .peek(key)
                .filter(|entry| entry.is_fresh(modified, original_size))
                .cloned()
        };

        match found {
            Some(entry) => {
                if let Ok(mut entries) = self.entries.try_write() {
                    entries.promote(key);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `entry` unless a fresh one is already present or it exceeds the size limit.
    /// Returns the entry that should be served.
    pub fn fill(&self, key: CacheKey, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        if entry.size > self.max_file_size {
            return entry;
        }
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = entries.peek(&key) {
            if existing.is_fresh(entry.modified, entry.original_size) {
                return existing.clone();
            }
        }
        if let Some((evicted, _)) = entries.push(key, entry.clone()) {
            tracing::trace!("Evicted {} ({})", evicted.path.display(), evicted.encoding.as_str());
        }
        self.fills.fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Drop every entry for `path`
    pub fn invalidate(&self, path: &Path) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for encoding in [Encoding::Identity, Encoding::Gzip] {
            entries.pop(&CacheKey::new(encoding, path));
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fills: self.fills.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
