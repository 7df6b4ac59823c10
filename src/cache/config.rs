//! Runtime cache configuration consumed by the middleware.

pub const DEFAULT_CACHE_ROOT: &str = "cache";
/// Bodies at or above this size are streamed from disk on a hit.
pub const DEFAULT_STREAM_THRESHOLD_BYTES: u64 = 16 * 1024;
/// Largest request or response body the middleware buffers.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Serve and capture responses at all.
    pub enabled: bool,
    /// Split point between buffered and streamed hits.
    pub stream_threshold_bytes: u64,
    /// Cap on buffered request bodies (for keying) and response bodies (for storing).
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_threshold_bytes: DEFAULT_STREAM_THRESHOLD_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            stream_threshold_bytes: settings.stream_threshold_bytes.get(),
            max_body_bytes: settings.max_body_bytes.get(),
        }
    }
}

impl CacheConfig {
    /// Whether a body of `size` bytes is served by streaming its file.
    pub fn streams(&self, size: u64) -> bool {
        size >= self.stream_threshold_bytes
    }
}
