use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

use crate::integration::common::{authed, json_body, send_json, setup_test_app};

fn search_request(body: serde_json::Value) -> Request<Body> {
    authed(Request::post("/v1/search"))
        .header("content-type", "application/json")
        .body(json_body(body))
        .unwrap()
}

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app();

    let (status, json) = send_json(
        &app.router,
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["database"], "disabled");
    assert_eq!(json["sources"], 2);
    assert_eq!(json["open_circuits"], 0);
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app();

    let (status, json) = send_json(
        &app.router,
        Request::get("/v1/sources").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "unauthorized");
}

#[tokio::test]
async fn wrong_api_key_returns_401() {
    let app = setup_test_app();

    let (status, _) = send_json(
        &app.router,
        Request::get("/v1/sources")
            .header("authorization", "Bearer wrong-key")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn search_reports_partial_failure() {
    let app = setup_test_app();

    let (status, json) = send_json(&app.router, search_request(serde_json::json!({}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 3);
    assert_eq!(json["listings"].as_array().unwrap().len(), 3);
    assert_eq!(json["sources_succeeded"], serde_json::json!(["alpha"]));
    assert_eq!(json["sources_failed"][0]["source"], "beta");
    assert_eq!(json["sources_failed"][0]["kind"], "unknown");
    assert_eq!(json["partial"], true);
    assert_eq!(json["cached"], false);
}

#[tokio::test]
async fn repeated_search_is_served_from_cache() {
    let app = setup_test_app();
    let body = serde_json::json!({"make": "Honda", "page_size": 2});

    send_json(&app.router, search_request(body.clone())).await;
    let (status, json) = send_json(&app.router, search_request(serde_json::json!({"make": "honda ", "page": 2, "page_size": 2}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cached"], true);
    assert_eq!(json["page"], 2);
    assert_eq!(json["listings"].as_array().unwrap().len(), 1);
    assert_eq!(app.alpha.calls(), 1);
}

#[tokio::test]
async fn invalid_search_returns_400() {
    let app = setup_test_app();

    let (status, json) = send_json(
        &app.router,
        search_request(serde_json::json!({"year_min": 2020, "year_max": 2010})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_request");
    assert_eq!(app.alpha.calls(), 0);
}

#[tokio::test]
async fn search_with_running_session_returns_409() {
    let app = setup_test_app();
    let session_id = Uuid::new_v4();
    assert!(app.aggregator.progress().claim(session_id));

    let (status, json) = send_json(
        &app.router,
        search_request(serde_json::json!({"session_id": session_id})),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "conflict");
    assert_eq!(app.alpha.calls(), 0);
    // The running search keeps its session.
    assert!(app.aggregator.progress().is_running(session_id));
}

#[tokio::test]
async fn list_sources_includes_runtime_stats() {
    let app = setup_test_app();

    let (status, json) = send_json(
        &app.router,
        authed(Request::get("/v1/sources")).body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let sources = json["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0]["id"], "alpha");
    assert_eq!(sources[0]["kind"], "api");
    assert_eq!(sources[0]["circuit"]["state"], "closed");
    assert!(json.get("health").is_none());

    let (_, json) = send_json(
        &app.router,
        authed(Request::get("/v1/sources?health=true")).body(Body::empty()).unwrap(),
    )
    .await;
    let health = json["health"].as_array().unwrap();
    assert_eq!(health.len(), 2);
    assert_eq!(health[0]["status"], "healthy");
}

#[tokio::test]
async fn disabling_a_source_removes_it_from_search() {
    let app = setup_test_app();

    let (status, json) = send_json(
        &app.router,
        authed(Request::patch("/v1/sources/beta"))
            .header("content-type", "application/json")
            .body(json_body(serde_json::json!({"enabled": false})))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enabled"], false);

    let (_, json) = send_json(&app.router, search_request(serde_json::json!({}))).await;

    assert_eq!(json["partial"], false);
    assert_eq!(json["sources_succeeded"], serde_json::json!(["alpha"]));
    assert_eq!(app.beta.calls(), 0);
}

#[tokio::test]
async fn updating_unknown_source_returns_404() {
    let app = setup_test_app();

    let (status, json) = send_json(
        &app.router,
        authed(Request::patch("/v1/sources/nope"))
            .header("content-type", "application/json")
            .body(json_body(serde_json::json!({"enabled": true})))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn reset_closes_an_open_circuit() {
    let app = setup_test_app();
    send_json(&app.router, search_request(serde_json::json!({}))).await;

    let beta_state = |json: &serde_json::Value| {
        json["sources"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["id"] == "beta")
            .map(|s| s["circuit"]["state"].clone())
            .unwrap()
    };

    let (_, json) = send_json(
        &app.router,
        authed(Request::get("/v1/sources")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(beta_state(&json), "open");

    let (status, _) = send_json(
        &app.router,
        authed(Request::post("/v1/sources/beta/reset")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, json) = send_json(
        &app.router,
        authed(Request::get("/v1/sources")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(beta_state(&json), "closed");

    let (status, _) = send_json(
        &app.router,
        authed(Request::post("/v1/sources/nope/reset")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn progress_streams_events_for_a_session() {
    let app = setup_test_app();
    let session_id = Uuid::new_v4();

    // Subscribe first, then run the search under the same session.
    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::get(format!("/v1/progress/{session_id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let (status, _) = send_json(
        &app.router,
        search_request(serde_json::json!({"session_id": session_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert_eq!(text.matches("event: source").count(), 4);
    assert_eq!(text.matches("event: finished").count(), 1);
    assert!(text.contains("\"status\":\"succeeded\""));
    assert!(text.contains("\"status\":\"failed\""));
}

#[tokio::test]
async fn late_progress_subscriber_gets_finished_event() {
    let app = setup_test_app();
    let session_id = Uuid::new_v4();

    send_json(
        &app.router,
        search_request(serde_json::json!({"session_id": session_id})),
    )
    .await;

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::get(format!("/v1/progress/{session_id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(!text.contains("event: source"));
    assert!(text.contains("event: finished"));
    assert!(text.contains("\"succeeded\":1"));
}

#[tokio::test]
async fn openapi_document_lists_routes() {
    let app = setup_test_app();

    let (status, json) = send_json(
        &app.router,
        Request::get("/api-docs/openapi.json").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["paths"].get("/v1/search").is_some());
    assert!(json["paths"].get("/v1/progress/{session_id}").is_some());
}
