//! Metric names emitted along the cache paths.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
};
use metrics_util::debugging::DebuggingRecorder;
use tempfile::TempDir;
use tiercache::cache::{CacheConfig, CacheEngine, CacheState, RuleRegistry, response_cache_layer};
use tower::ServiceExt;

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let dir = TempDir::new().expect("temp dir");
    let config = CacheConfig::default();
    let engine = Arc::new(CacheEngine::new(dir.path().join("cache")).expect("engine"));

    let mut rules = RuleRegistry::new();
    rules
        .add_rule("^/tags/", "text/html", Some(Duration::from_secs(60)))
        .expect("valid pattern");
    let state = CacheState::new(config, Arc::clone(&engine), rules);

    let app = Router::new()
        .route("/tags/{slug}", get(|| async { "tag page" }))
        .layer(middleware::from_fn_with_state(state, response_cache_layer));

    let requests = [
        ("/tags/one", None),
        ("/tags/one", None),
        ("/tags/one", Some("no-cache")),
    ];
    for (uri, cache_control) in requests {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(value) = cache_control {
            builder = builder.header("cache-control", value);
        }
        let request = builder.body(Body::empty()).expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert!(!engine.set("../bad", b"x", "text/plain", None, Vec::new()).await);
    assert!(engine.invalidate("").await);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "tiercache_hit_total",
        "tiercache_miss_total",
        "tiercache_bypass_total",
        "tiercache_store_total",
        "tiercache_store_failed_total",
        "tiercache_evict_total",
        "tiercache_captures_in_flight",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
