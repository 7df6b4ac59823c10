//! Cache engine: metadata index plus body storage.
//!
//! Storage failures never escape this boundary. Reads degrade to a miss,
//! writes and invalidations report `false`, and each failure is logged.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use time::OffsetDateTime;
use tokio::{
    fs::File,
    sync::{Mutex, OwnedMutexGuard},
};
use tracing::{debug, warn};

use super::index::{CacheEntryMetadata, MetadataIndex};
use super::store::{BodyStore, StoreError};

const METRIC_STORE_TOTAL: &str = "tiercache_store_total";
const METRIC_STORE_FAILED_TOTAL: &str = "tiercache_store_failed_total";
const METRIC_EVICT_TOTAL: &str = "tiercache_evict_total";

#[derive(Debug)]
pub struct CacheEngine {
    index: MetadataIndex,
    store: BodyStore,
    /// Per-key locks held across body replacement and metadata publication.
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Exclusive right to replace one key; the lock entry is dropped with the last holder.
struct KeyWriteGuard<'a> {
    key: &'a str,
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyWriteGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl CacheEngine {
    /// Create an engine whose bodies live under `root`.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        Ok(Self {
            index: MetadataIndex::new(),
            store: BodyStore::new(root)?,
            write_locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &std::path::Path {
        self.store.root()
    }

    /// Look up a live entry.
    ///
    /// Expired entries and entries whose body file has vanished are evicted
    /// and reported as a miss.
    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntryMetadata>> {
        let entry = self.index.get(key)?;

        if entry.is_expired_at(OffsetDateTime::now_utc()) {
            self.evict(key, &entry, "expired");
            return None;
        }

        if !self.store.exists(&entry.body_path).await {
            warn!(
                op = "engine::get",
                result = "missing_body",
                key,
                path = %entry.body_path.display(),
                "Indexed body is gone; evicting entry"
            );
            self.evict(key, &entry, "missing_body");
            return None;
        }

        Some(entry)
    }

    /// Body bytes of a live entry; any failure is a miss.
    pub async fn get_body(&self, key: &str) -> Option<Bytes> {
        let entry = self.get(key).await?;
        match self.read_body(&entry).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(
                    op = "engine::get_body",
                    result = "error",
                    key,
                    error = %err,
                    "Failed to read cached body"
                );
                None
            }
        }
    }

    /// Read the body an entry points at.
    pub async fn read_body(&self, entry: &CacheEntryMetadata) -> Result<Bytes, StoreError> {
        self.store.read(&entry.body_path).await
    }

    /// Open the body an entry points at for streaming.
    pub async fn open_body(&self, entry: &CacheEntryMetadata) -> Result<File, StoreError> {
        self.store.open(&entry.body_path).await
    }

    /// Store a response body and publish its metadata.
    ///
    /// Returns false when the body could not be written; the previous entry
    /// for `key`, if any, is left as it was. Writers of the same key are
    /// serialized so the published metadata always describes the body on disk.
    pub async fn set(
        &self,
        key: &str,
        content: &[u8],
        content_type: &str,
        ttl: Option<Duration>,
        headers: Vec<(String, String)>,
    ) -> bool {
        let _write = self.lock_key(key).await;

        let body_path = match self.store.write(key, content).await {
            Ok(path) => path,
            Err(err) => {
                counter!(METRIC_STORE_FAILED_TOTAL).increment(1);
                warn!(
                    op = "engine::set",
                    result = "error",
                    key,
                    error = %err,
                    "Failed to store cached body"
                );
                return false;
            }
        };

        let metadata = CacheEntryMetadata {
            content_type: content_type.to_string(),
            created_at: OffsetDateTime::now_utc(),
            ttl,
            headers,
            body_path,
            body_size: content.len() as u64,
        };
        self.index.publish(key.to_string(), metadata);

        counter!(METRIC_STORE_TOTAL).increment(1);
        debug!(
            op = "engine::set",
            result = "stored",
            key,
            body_size = content.len(),
            "Stored cache entry"
        );
        true
    }

    /// Drop every entry and body file whose key starts with `prefix`.
    ///
    /// A prefix matching nothing succeeds. Returns false only when an existing
    /// file could not be deleted.
    pub async fn invalidate(&self, prefix: &str) -> bool {
        let entries = self.index.remove_prefix(prefix);
        if entries > 0 {
            counter!(METRIC_EVICT_TOTAL, "reason" => "invalidated").increment(entries as u64);
        }

        match self.store.remove_prefix(prefix).await {
            Ok(files) => {
                debug!(
                    op = "engine::invalidate",
                    result = "ok",
                    prefix,
                    entries,
                    files,
                    "Invalidated cache prefix"
                );
                true
            }
            Err(err) => {
                warn!(
                    op = "engine::invalidate",
                    result = "error",
                    prefix,
                    entries,
                    error = %err,
                    "Failed to delete cached bodies"
                );
                false
            }
        }
    }

    /// Invalidate everything.
    pub async fn clear(&self) -> bool {
        self.invalidate("").await
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    async fn lock_key<'a>(&'a self, key: &'a str) -> KeyWriteGuard<'a> {
        let lock = self
            .write_locks
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();
        KeyWriteGuard {
            key,
            locks: &self.write_locks,
            guard: Some(lock.lock_owned().await),
        }
    }

    fn evict(&self, key: &str, entry: &Arc<CacheEntryMetadata>, reason: &'static str) {
        if self.index.remove_if_current(key, entry) {
            counter!(METRIC_EVICT_TOTAL, "reason" => reason).increment(1);
            debug!(op = "engine::evict", result = reason, key, "Evicted cache entry");
        }
    }
}
