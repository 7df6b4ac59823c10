//! Response cache middleware.
//!
//! Requests whose path matches a rule are looked up by their derived key. A
//! hit is answered from storage without running the handler; a miss runs the
//! handler with its response captured, stores it when the status is 200, and
//! hands the captured bytes on to the client. Bodies larger than the configured
//! cap are never buffered whole: oversized requests are refused and oversized
//! responses are forwarded without being stored.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode,
        header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, future, stream};
use http_body_util::BodyExt;
use metrics::counter;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use super::{
    CacheConfig, CacheEngine, RuleRegistry,
    capture::CaptureTable,
    directives::RequestDirectives,
    index::CacheEntryMetadata,
    keys::{RequestBodyError, derive_request_key},
    registry::CacheRule,
    store::StoreError,
};

const METRIC_HIT_TOTAL: &str = "tiercache_hit_total";
const METRIC_MISS_TOTAL: &str = "tiercache_miss_total";
const METRIC_BYPASS_TOTAL: &str = "tiercache_bypass_total";

/// Diagnostic header reporting how the cache handled a request.
pub const X_CACHE: &str = "x-cache";

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub engine: Arc<CacheEngine>,
    pub rules: Arc<RuleRegistry>,
    pub captures: CaptureTable,
}

impl CacheState {
    pub fn new(config: CacheConfig, engine: Arc<CacheEngine>, rules: RuleRegistry) -> Self {
        Self {
            config,
            engine,
            rules: Arc::new(rules),
            captures: CaptureTable::new(),
        }
    }
}

/// Middleware serving and capturing cacheable responses.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.config.enabled {
        return next.run(request).await;
    }

    let Some(rule) = cache.rules.find_rule(request.uri().path()).cloned() else {
        return next.run(request).await;
    };

    let directives = RequestDirectives::from_headers(request.headers());

    let (key, request) = match derive_request_key(request, cache.config.max_body_bytes).await {
        Ok(derived) => derived,
        Err(err @ RequestBodyError::TooLarge { .. }) => {
            debug!(
                op = "middleware::derive_key",
                result = "too_large",
                error = %err,
                "Request body over the cache limit"
            );
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
        Err(err) => {
            warn!(
                op = "middleware::derive_key",
                result = "error",
                error = %err,
                "Failed to read request body for cache key"
            );
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if directives.no_cache {
        counter!(METRIC_BYPASS_TOTAL).increment(1);
        debug!(cache = "response", outcome = "bypass", key = %key, "client requested no-cache");
    } else if let Some(entry) = cache.engine.get(&key).await {
        counter!(METRIC_HIT_TOTAL).increment(1);
        debug!(
            cache = "response",
            outcome = "hit",
            key = %key,
            body_size = entry.body_size,
            "serving cached response"
        );
        return serve_hit(&cache.config, &cache.engine, &key, &entry).await;
    } else {
        counter!(METRIC_MISS_TOTAL).increment(1);
        debug!(cache = "response", outcome = "miss", key = %key, "cache miss, executing handler");
    }

    capture_response(&cache, key, rule, directives, request, next).await
}

/// Run the handler with its response captured, then store and forward it.
async fn capture_response(
    cache: &CacheState,
    key: String,
    rule: CacheRule,
    directives: RequestDirectives,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let guard = cache.captures.begin(key, rule.content_type, rule.ttl);
    request.extensions_mut().insert(guard.capture().clone());

    let response = next.run(request).await;
    let (mut parts, body) = response.into_parts();

    let buffered = match buffer_response(body, cache.config.max_body_bytes).await {
        Ok(Buffered::Complete(bytes)) => bytes,
        Ok(Buffered::Oversized(body)) => {
            debug!(
                cache = "response",
                outcome = "too_large",
                key = %guard.capture().key,
                limit = cache.config.max_body_bytes,
                "response over the cache limit, forwarding without storing"
            );
            mark(&mut parts.headers, "BYPASS");
            return Response::from_parts(parts, body);
        }
        Err(err) => {
            warn!(
                op = "middleware::capture",
                result = "error",
                key = %guard.capture().key,
                error = %err,
                "Failed to buffer handler response"
            );
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let Some(capture) = guard.release() else {
        warn!(
            op = "middleware::capture",
            result = "released_elsewhere",
            "Capture vanished before restore; forwarding without storing"
        );
        return Response::from_parts(parts, Body::from(buffered));
    };

    let outcome = if directives.no_store {
        "no_store"
    } else if parts.status != StatusCode::OK {
        "not_ok"
    } else if cache
        .engine
        .set(
            &capture.key,
            &buffered,
            &capture.content_type,
            capture.ttl,
            saved_headers(&parts.headers),
        )
        .await
    {
        "stored"
    } else {
        "store_failed"
    };

    debug!(
        cache = "response",
        outcome,
        key = %capture.key,
        status = parts.status.as_u16(),
        body_size = buffered.len(),
        "captured handler response"
    );

    let marker = if directives.no_cache || outcome != "stored" {
        "BYPASS"
    } else {
        "MISS"
    };
    mark(&mut parts.headers, marker);

    Response::from_parts(parts, Body::from(buffered))
}

/// A handler response read into memory, or handed back intact once it outgrew the cap.
enum Buffered {
    Complete(Bytes),
    Oversized(Body),
}

/// Buffer at most `limit` bytes of `body`.
///
/// Past the limit the bytes read so far are chained in front of the unread
/// remainder, so the client still receives the whole body.
async fn buffer_response(mut body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let mut buffered = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        buffered.extend_from_slice(&data);

        if buffered.len() > limit {
            let head = stream::once(future::ready(Ok::<_, axum::Error>(buffered.freeze())));
            let rest = head.chain(body.into_data_stream());
            return Ok(Buffered::Oversized(Body::from_stream(rest)));
        }
    }

    Ok(Buffered::Complete(buffered.freeze()))
}

fn mark(headers: &mut HeaderMap, marker: &'static str) {
    headers.insert(HeaderName::from_static(X_CACHE), HeaderValue::from_static(marker));
}

/// Answer a hit from storage, streaming large bodies straight from their file.
async fn serve_hit(
    config: &CacheConfig,
    engine: &CacheEngine,
    key: &str,
    entry: &CacheEntryMetadata,
) -> Response {
    let body = if config.streams(entry.body_size) {
        match engine.open_body(entry).await {
            Ok(file) => Body::from_stream(ReaderStream::new(file)),
            Err(err) => return unreadable_body(key, err),
        }
    } else {
        match engine.read_body(entry).await {
            Ok(bytes) => Body::from(bytes),
            Err(err) => return unreadable_body(key, err),
        }
    };

    let mut response = Response::new(body);
    let headers = response.headers_mut();

    for (name, value) in &entry.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(header = %name, "skipping unrepresentable cached header"),
        }
    }

    if let Ok(content_type) = HeaderValue::from_str(&entry.content_type) {
        headers.insert(CONTENT_TYPE, content_type);
    }
    mark(headers, "HIT");

    response
}

fn unreadable_body(key: &str, err: StoreError) -> Response {
    warn!(
        op = "middleware::serve_hit",
        result = "error",
        key,
        error = %err,
        "Cached body present but unreadable"
    );
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

/// Response headers worth replaying on a hit, in response order.
///
/// Framing headers are recomputed per response and the content type is
/// carried by the entry itself.
fn saved_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            ![CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION, CONTENT_TYPE].contains(*name)
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use axum::http::header::{CACHE_CONTROL, ETAG};

    use super::*;

    #[test]
    fn saved_headers_drop_framing_and_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(ETAG, HeaderValue::from_static("\"abc\""));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=60"));

        let saved = saved_headers(&headers);

        assert_eq!(
            saved,
            vec![
                ("etag".to_string(), "\"abc\"".to_string()),
                ("cache-control".to_string(), "public, max-age=60".to_string()),
            ]
        );
    }

    fn chunked(chunks: &[&'static str]) -> Body {
        let chunks: Vec<Result<Bytes, axum::Error>> =
            chunks.iter().copied().map(|chunk| Ok(Bytes::from_static(chunk.as_bytes()))).collect();
        Body::from_stream(stream::iter(chunks))
    }

    async fn collect(body: Body) -> Bytes {
        body.collect().await.expect("body should collect").to_bytes()
    }

    #[tokio::test]
    async fn buffer_response_keeps_bodies_within_limit() {
        let buffered = buffer_response(chunked(&["abc", "def"]), 6)
            .await
            .expect("body should read");

        match buffered {
            Buffered::Complete(bytes) => assert_eq!(&bytes[..], b"abcdef"),
            Buffered::Oversized(_) => panic!("body within the limit was not buffered"),
        }
    }

    #[tokio::test]
    async fn buffer_response_hands_back_whole_oversized_body() {
        let buffered = buffer_response(chunked(&["abc", "def", "ghi"]), 4)
            .await
            .expect("body should read");

        match buffered {
            Buffered::Oversized(body) => assert_eq!(&collect(body).await[..], b"abcdefghi"),
            Buffered::Complete(_) => panic!("oversized body was buffered"),
        }
    }

    #[test]
    fn saved_headers_skip_non_ascii_values() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-title"),
            HeaderValue::from_bytes("caf\u{e9}".as_bytes()).expect("opaque header value"),
        );
        assert!(saved_headers(&headers).is_empty());
    }
}
