//! Bookkeeping for responses being captured on a cache miss.
//!
//! Each miss registers its capture under a fresh token before the handler
//! runs. The request carries the token; the shared table owns the capture
//! until the middleware releases it after buffering the response. Dropping the
//! guard without releasing (for example when the request future is cancelled)
//! removes the entry as well, so the table only ever holds in-flight misses.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::gauge;
use uuid::Uuid;

const METRIC_CAPTURES_IN_FLIGHT: &str = "tiercache_captures_in_flight";

/// Per-request identifier of an in-flight capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureToken(Uuid);

impl fmt::Display for CaptureToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// What a captured response will be stored as.
///
/// Inserted into request extensions so handlers can tell they are being captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCapture {
    pub token: CaptureToken,
    pub key: String,
    pub content_type: String,
    pub ttl: Option<Duration>,
}

/// Shared table of in-flight captures keyed by token.
#[derive(Debug, Clone, Default)]
pub struct CaptureTable {
    inner: Arc<DashMap<CaptureToken, ActiveCapture>>,
}

impl CaptureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capture and return the guard that releases it.
    pub fn begin(
        &self,
        key: String,
        content_type: String,
        ttl: Option<Duration>,
    ) -> CaptureGuard {
        let token = CaptureToken(Uuid::new_v4());
        let capture = ActiveCapture {
            token,
            key,
            content_type,
            ttl,
        };
        self.inner.insert(token, capture.clone());
        self.report();

        CaptureGuard {
            capture,
            table: self.clone(),
            released: false,
        }
    }

    pub fn get(&self, token: CaptureToken) -> Option<ActiveCapture> {
        self.inner.get(&token).map(|entry| entry.value().clone())
    }

    /// Number of captures currently registered.
    pub fn in_flight(&self) -> usize {
        self.inner.len()
    }

    fn release(&self, token: CaptureToken) -> Option<ActiveCapture> {
        let released = self.inner.remove(&token).map(|(_, capture)| capture);
        self.report();
        released
    }

    fn report(&self) {
        gauge!(METRIC_CAPTURES_IN_FLIGHT).set(self.inner.len() as f64);
    }
}

/// Owns one registration in a [`CaptureTable`].
pub struct CaptureGuard {
    capture: ActiveCapture,
    table: CaptureTable,
    released: bool,
}

impl CaptureGuard {
    pub fn capture(&self) -> &ActiveCapture {
        &self.capture
    }

    /// Remove the registration, handing back the capture the table held.
    pub fn release(mut self) -> Option<ActiveCapture> {
        self.released = true;
        self.table.release(self.capture.token)
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if !self.released {
            self.table.release(self.capture.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_returns_registered_capture_and_empties_table() {
        let table = CaptureTable::new();
        let guard = table.begin("k".to_string(), "text/html".to_string(), None);
        let token = guard.capture().token;

        assert_eq!(table.in_flight(), 1);
        assert_eq!(table.get(token).map(|c| c.key), Some("k".to_string()));

        let released = guard.release().expect("capture registered");
        assert_eq!(released.content_type, "text/html");
        assert_eq!(table.in_flight(), 0);
        assert!(table.get(token).is_none());
    }

    #[test]
    fn concurrent_captures_are_tracked_independently() {
        let table = CaptureTable::new();
        let first = table.begin("a".to_string(), "text/plain".to_string(), None);
        let second = table.begin(
            "b".to_string(),
            "application/json".to_string(),
            Some(Duration::from_secs(9)),
        );

        assert_ne!(first.capture().token, second.capture().token);
        assert_eq!(table.in_flight(), 2);

        let b = second.release().expect("second registered");
        assert_eq!(b.key, "b");
        assert_eq!(b.ttl, Some(Duration::from_secs(9)));
        assert_eq!(table.in_flight(), 1);

        let a = first.release().expect("first registered");
        assert_eq!(a.key, "a");
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn dropped_guard_cleans_up() {
        let table = CaptureTable::new();
        {
            let _guard = table.begin("k".to_string(), "text/html".to_string(), None);
            assert_eq!(table.in_flight(), 1);
        }
        assert_eq!(table.in_flight(), 0);
    }
}
