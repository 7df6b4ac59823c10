//! Client-supplied `Cache-Control` directives.

use axum::http::{HeaderMap, header::CACHE_CONTROL};

/// Directives a request can use to steer the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestDirectives {
    /// Skip the lookup; the response may still be stored.
    pub no_cache: bool,
    /// Do not store the response.
    pub no_store: bool,
}

impl RequestDirectives {
    /// Parse every `Cache-Control` header as comma-separated, case-insensitive tokens.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut directives = Self::default();

        let tokens = headers
            .get_all(CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','));

        for token in tokens {
            let name = token.split('=').next().unwrap_or_default().trim();
            if name.eq_ignore_ascii_case("no-cache") {
                directives.no_cache = true;
            } else if name.eq_ignore_ascii_case("no-store") {
                directives.no_store = true;
            }
        }

        directives
    }
}
