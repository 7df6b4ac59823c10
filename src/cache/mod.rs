//! Two-tier HTTP response cache.
//!
//! - **Metadata index**: in-memory descriptors of cached responses
//! - **Body store**: one `<key>.body` file per entry under the cache root
//!
//! The engine composes both; the middleware derives keys from requests, serves
//! hits and captures misses.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! root = "/var/cache/tiercache"
//! stream_threshold_bytes = 16384
//! max_body_bytes = 1048576
//!
//! [[cache.rules]]
//! pattern = "^/api/reports/"
//! content_type = "application/json"
//! ttl_seconds = 300
//! ```

mod capture;
mod config;
mod directives;
mod engine;
mod index;
mod keys;
mod lock;
mod middleware;
mod registry;
mod store;

pub use capture::{ActiveCapture, CaptureGuard, CaptureTable, CaptureToken};
pub use config::{
    CacheConfig, DEFAULT_CACHE_ROOT, DEFAULT_MAX_BODY_BYTES, DEFAULT_STREAM_THRESHOLD_BYTES,
};
pub use directives::RequestDirectives;
pub use engine::CacheEngine;
pub use index::{CacheEntryMetadata, MetadataIndex};
pub use keys::{
    BODY_HASH_LEN, QueryParams, RequestBodyError, body_is_significant, derive_request_key,
    generate_key, parse_query,
};
pub use middleware::{CacheState, X_CACHE, response_cache_layer};
pub use registry::{CacheRule, RuleError, RuleRegistry};
pub use store::{BODY_SUFFIX, BodyStore, LEGACY_SUFFIX, StoreError};
