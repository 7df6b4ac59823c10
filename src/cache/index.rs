//! In-memory metadata index.
//!
//! Entries are immutable and shared as `Arc`s: a store builds the complete
//! metadata first and publishes it under its key in a single insert, so readers
//! see either the previous entry or the new one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use time::OffsetDateTime;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::index";

/// Descriptor of a cached response, excluding its body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryMetadata {
    pub content_type: String,
    pub created_at: OffsetDateTime,
    /// `None` never expires.
    pub ttl: Option<Duration>,
    /// Response headers in the order they were captured.
    pub headers: Vec<(String, String)>,
    pub body_path: PathBuf,
    pub body_size: u64,
}

impl CacheEntryMetadata {
    /// An entry is expired once its age strictly exceeds its ttl.
    ///
    /// A ttl of zero therefore still hits within the instant it was stored.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => now - self.created_at > ttl,
        }
    }
}

/// Process-wide mapping from cache key to entry metadata.
#[derive(Debug, Default)]
pub struct MetadataIndex {
    entries: RwLock<HashMap<String, Arc<CacheEntryMetadata>>>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CacheEntryMetadata>> {
        rw_read(&self.entries, SOURCE, "get").get(key).cloned()
    }

    /// Publish a fully built entry, replacing whatever was stored under `key`.
    pub fn publish(
        &self,
        key: String,
        metadata: CacheEntryMetadata,
    ) -> Option<Arc<CacheEntryMetadata>> {
        let entry = Arc::new(metadata);
        rw_write(&self.entries, SOURCE, "publish").insert(key, entry)
    }

    /// Remove `key` only while it still maps to `expected`.
    ///
    /// Returns false when the entry was already replaced or removed.
    pub fn remove_if_current(&self, key: &str, expected: &Arc<CacheEntryMetadata>) -> bool {
        let mut entries = rw_write(&self.entries, SOURCE, "remove_if_current");
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Remove every entry whose key starts with `prefix`, returning how many went.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "remove_prefix");
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        rw_read(&self.entries, SOURCE, "contains").contains_key(key)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use time::Duration as TimeDuration;

    use super::*;

    fn sample(ttl: Option<Duration>) -> CacheEntryMetadata {
        CacheEntryMetadata {
            content_type: "text/html".to_string(),
            created_at: OffsetDateTime::now_utc(),
            ttl,
            headers: vec![("x-frame-options".to_string(), "DENY".to_string())],
            body_path: PathBuf::from("/tmp/sample.body"),
            body_size: 5,
        }
    }

    #[test]
    fn expiry_is_strictly_after_ttl() {
        let entry = sample(Some(Duration::from_secs(10)));
        let created = entry.created_at;

        assert!(!entry.is_expired_at(created + TimeDuration::seconds(9)));
        assert!(!entry.is_expired_at(created + TimeDuration::seconds(10)));
        assert!(entry.is_expired_at(created + TimeDuration::seconds(11)));
    }

    #[test]
    fn zero_ttl_hits_only_in_the_same_instant() {
        let entry = sample(Some(Duration::ZERO));
        let created = entry.created_at;

        assert!(!entry.is_expired_at(created));
        assert!(entry.is_expired_at(created + TimeDuration::milliseconds(1)));
    }

    #[test]
    fn missing_ttl_never_expires() {
        let entry = sample(None);
        let far_future = entry.created_at + TimeDuration::days(365 * 100);
        assert!(!entry.is_expired_at(far_future));
    }

    #[test]
    fn publish_replaces_whole_entry() {
        let index = MetadataIndex::new();
        index.publish("page".to_string(), sample(None));

        let mut replacement = sample(Some(Duration::from_secs(1)));
        replacement.body_size = 42;
        let previous = index.publish("page".to_string(), replacement);

        assert_eq!(previous.map(|entry| entry.body_size), Some(5));
        let current = index.get("page").expect("entry present");
        assert_eq!(current.body_size, 42);
        assert_eq!(current.ttl, Some(Duration::from_secs(1)));
    }

    #[test]
    fn remove_if_current_keeps_newer_entry() {
        let index = MetadataIndex::new();
        index.publish("k".to_string(), sample(None));
        let stale = index.get("k").expect("entry present");

        index.publish("k".to_string(), sample(None));

        assert!(!index.remove_if_current("k", &stale));
        assert!(index.contains("k"));

        let current = index.get("k").expect("entry present");
        assert!(index.remove_if_current("k", &current));
        assert!(!index.contains("k"));
    }

    #[test]
    fn remove_prefix_leaves_unrelated_keys() {
        let index = MetadataIndex::new();
        for key in ["user_123_data", "user_123_profile", "user_456_data"] {
            index.publish(key.to_string(), sample(None));
        }

        assert_eq!(index.remove_prefix("user_123"), 2);
        assert_eq!(index.len(), 1);
        assert!(index.contains("user_456_data"));
    }

    #[test]
    fn index_recovers_from_poisoned_lock() {
        let index = MetadataIndex::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = index
                .entries
                .write()
                .expect("index lock should be acquired");
            panic!("poison index lock");
        }));

        index.publish("after".to_string(), sample(None));
        assert!(index.get("after").is_some());
    }
}
