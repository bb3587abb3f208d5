use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use futures::Stream;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use motorsift_core::circuit_breaker::CircuitState;
use motorsift_core::progress::ProgressEvent;

use crate::auth::require_api_key;
use crate::dto::{
    HealthResponse, SearchBody, SearchResponse, SourceHealthResponse, SourceListQuery,
    SourceListResponse, SourceResponse, UpdateSourceRequest,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/search", post(search))
        .route("/v1/sources", get(list_sources))
        .route("/v1/sources/{id}", patch(update_source))
        .route("/v1/sources/{id}/reset", post(reset_source))
        .route("/v1/progress/{session_id}", get(progress))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/search",
    request_body = SearchBody,
    responses(
        (status = 200, description = "Merged listings with per-source outcome", body = SearchResponse),
        (status = 400, description = "Invalid search request", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 409, description = "A search is already running under this session_id", body = crate::dto::ErrorResponse),
        (status = 503, description = "No sources configured", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "search"
)]
pub async fn search(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<SearchBody>,
) -> Response {
    let request = body.to_request();
    let session_id = body.session_id.unwrap_or_else(Uuid::new_v4);

    if !state.aggregator.progress().claim(session_id) {
        return ApiError::conflict(format!("Search already running for session {session_id}"));
    }

    match state.aggregator.search_with_session(&request, session_id).await {
        Ok(result) => axum::Json(SearchResponse::from(result)).into_response(),
        Err(e) => {
            // Release anyone already subscribed to this session.
            state.aggregator.progress().complete(session_id);
            ApiError::from(e).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/progress/{session_id}",
    params(
        ("session_id" = Uuid, Path, description = "Search session ID")
    ),
    responses(
        (status = 200, description = "Server-sent `source` and `finished` events", content_type = "text/event-stream", body = String),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "search"
)]
pub async fn progress(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.aggregator.progress().subscribe(session_id);

    // The reporter drops the sender after `finished`, which ends the stream.
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((to_sse_event(&event), rx))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &ProgressEvent) -> Result<Event, axum::Error> {
    let name = if event.is_finished() { "finished" } else { "source" };
    Event::default().event(name).json_data(event)
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/sources",
    params(SourceListQuery),
    responses(
        (status = 200, description = "Configured sources with runtime statistics", body = SourceListResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "sources"
)]
pub async fn list_sources(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SourceListQuery>,
) -> impl IntoResponse {
    let sources = state
        .aggregator
        .source_stats()
        .into_iter()
        .map(SourceResponse::from)
        .collect();

    let health = if query.health.unwrap_or(false) {
        let checks = state.aggregator.health_check_all().await;
        Some(checks.into_iter().map(SourceHealthResponse::from).collect())
    } else {
        None
    };

    axum::Json(SourceListResponse { sources, health })
}

#[utoipa::path(
    patch,
    path = "/v1/sources/{id}",
    params(
        ("id" = String, Path, description = "Source ID")
    ),
    request_body = UpdateSourceRequest,
    responses(
        (status = 200, description = "Updated source", body = SourceResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "sources"
)]
pub async fn update_source(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<UpdateSourceRequest>,
) -> Response {
    if state.aggregator.registry().set_enabled(&id, body.enabled).is_none() {
        return ApiError::not_found(format!("Source not found: {id}"));
    }
    tracing::info!(source = %id, enabled = body.enabled, "Source toggled");

    match source_response(&state, &id) {
        Some(source) => axum::Json(source).into_response(),
        None => ApiError::not_found(format!("Source not found: {id}")),
    }
}

#[utoipa::path(
    post,
    path = "/v1/sources/{id}/reset",
    params(
        ("id" = String, Path, description = "Source ID")
    ),
    responses(
        (status = 204, description = "Circuit closed"),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "sources"
)]
pub async fn reset_source(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    if state.aggregator.reset_source(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        ApiError::not_found(format!("Source not found: {id}"))
    }
}

fn source_response(state: &AppState, id: &str) -> Option<SourceResponse> {
    state
        .aggregator
        .source_stats()
        .into_iter()
        .find(|s| s.config.id == id)
        .map(SourceResponse::from)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.aggregator.source_stats();

    let database = match &state.database {
        None => "disabled",
        Some(db) => match db.health_check().await {
            Ok(()) => "ok",
            Err(_) => "error",
        },
    };

    let healthy = database != "error" && !stats.is_empty();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        sources: stats.len(),
        enabled_sources: stats.iter().filter(|s| s.config.enabled).count(),
        open_circuits: stats
            .iter()
            .filter(|s| s.circuit.state == CircuitState::Open)
            .count(),
        database,
        active_sessions: state.aggregator.progress().active_sessions(),
    };

    (status, axum::Json(response))
}
