use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use api::{router, ApiState};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use pconfig::ConfigReloader;
use prometheus::Registry;
use query::{NoopSymbolizer, QueryEngine};
use scrape::ScrapeManager;
use store::{ProfileKey, ProfileStore, RocksStore};
use tower::ServiceExt;

fn test_state() -> (tempfile::TempDir, tempfile::NamedTempFile, ApiState) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ProfileStore> = Arc::new(RocksStore::open(dir.path()).unwrap());
    let engine = Arc::new(QueryEngine::new(store.clone(), Arc::new(NoopSymbolizer)));

    struct NoopAppender;
    impl scrape::Appender for NoopAppender {
        fn append(&self, _labels: &common::Labels, _ts: i64, _raw: Vec<u8>) -> common::error::Result<()> {
            Ok(())
        }
    }
    let registry = Registry::new();
    let scrape_manager = Arc::new(ScrapeManager::new(Arc::new(NoopAppender), &registry));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "scrape_configs:\n  - job_name: api\n    static_configs: [{{targets: [\"a:1\"]}}]"
    )
    .unwrap();
    let (reloader, rx) = ConfigReloader::start(file.path()).unwrap();

    let state = ApiState {
        engine,
        scrape_manager,
        config: rx,
        reloader: Arc::new(reloader),
        registry: Registry::new(),
        query_timeout: Duration::from_secs(5),
    };
    (dir, file, state)
}

#[tokio::test]
async fn query_range_returns_series_for_matching_job() {
    let (_dir, _file, mut state) = test_state();

    let raw_store: Arc<dyn ProfileStore> = Arc::new(RocksStore::open(tempfile::tempdir().unwrap().into_path()).unwrap());
    raw_store
        .put(&ProfileKey::new(1000, "a", "cpu", "i1").encode(), b"x")
        .unwrap();
    raw_store
        .put(&ProfileKey::new(2000, "a", "cpu", "i1").encode(), b"y")
        .unwrap();
    state.engine = Arc::new(QueryEngine::new(raw_store, Arc::new(NoopSymbolizer)));

    let app = router(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/query_range?from=0&to=3000&query=job=a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "success");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["timestamps"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn query_range_rejects_empty_query_as_bad_request() {
    let (_dir, _file, state) = test_state();
    let app = router(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/query_range?from=0&to=1000&query=")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn targets_endpoint_reports_configured_job() {
    let (_dir, _file, state) = test_state();
    let config = state.config.borrow().clone();
    state.scrape_manager.apply(&config);

    let app = router(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/targets?state=active")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let active = body["data"]["active_targets"].as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["scrape_pool"], "api");
}

#[tokio::test]
async fn status_config_returns_yaml_text() {
    let (_dir, _file, state) = test_state();
    let app = router(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/status/config")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["data"]["yaml"].as_str().unwrap().contains("job_name: api"));
}

#[tokio::test]
async fn healthy_endpoint_returns_ok() {
    let (_dir, _file, state) = test_state();
    let app = router(state);
    let response = app
        .oneshot(Request::builder().uri("/-/healthy").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
