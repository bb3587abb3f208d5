use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use motorsift_core::cache::ResultCache;
use motorsift_core::config::{
    AdapterKind, CacheConfig, CircuitBreakerConfig, RetryPolicy, SchedulerConfig, SourceConfig,
};
use motorsift_core::error::UpstreamErrorKind;
use motorsift_core::registry::SourceRegistry;
use motorsift_core::scheduler::Aggregator;
use motorsift_core::testutil::{MockAdapter, sample_listings};
use motorsift_server::routes;
use motorsift_server::state::AppState;

pub const TEST_API_KEY: &str = "test-secret-key";

pub struct TestApp {
    pub router: Router,
    pub aggregator: Arc<Aggregator>,
    /// Succeeds with three listings.
    pub alpha: MockAdapter,
    /// Always fails; its circuit opens after one failure.
    pub beta: MockAdapter,
}

/// Router over an in-memory engine with two mock sources and no database.
pub fn setup_test_app() -> TestApp {
    let circuit = CircuitBreakerConfig {
        failure_threshold: 1,
        ..CircuitBreakerConfig::default()
    };
    let registry = Arc::new(SourceRegistry::new(circuit));

    let alpha = MockAdapter::with_listings("alpha", sample_listings("alpha", 3));
    let beta = MockAdapter::failing("beta", UpstreamErrorKind::Unknown);
    for adapter in [&alpha, &beta] {
        let id = motorsift_core::traits::SourceAdapter::id(adapter).to_string();
        registry
            .register(
                SourceConfig::new(id, AdapterKind::Api).with_retry(RetryPolicy::no_retry()),
                Arc::new(adapter.clone()),
            )
            .unwrap();
    }

    let cache = Arc::new(ResultCache::new(CacheConfig::default()));
    let aggregator = Arc::new(Aggregator::new(registry, cache, SchedulerConfig::default()));

    let state = Arc::new(AppState {
        aggregator: aggregator.clone(),
        api_key: TEST_API_KEY.to_string(),
        database: None,
    });

    TestApp {
        router: routes::router(state),
        aggregator,
        alpha,
        beta,
    }
}

/// Send a request with the test bearer key and decode the JSON body.
pub async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

pub fn authed(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header("authorization", format!("Bearer {TEST_API_KEY}"))
}

pub fn json_body(value: serde_json::Value) -> Body {
    Body::from(serde_json::to_vec(&value).unwrap())
}
