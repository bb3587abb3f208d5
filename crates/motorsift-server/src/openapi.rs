use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Motorsift API",
        version = "0.1.0",
        description = "Aggregated vehicle-listing search across unreliable sources."
    ),
    paths(
        crate::routes::search,
        crate::routes::progress,
        crate::routes::list_sources,
        crate::routes::update_source,
        crate::routes::reset_source,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::SearchBody,
        crate::dto::SortParam,
        crate::dto::SearchResponse,
        crate::dto::ListingResponse,
        crate::dto::SourceFailureResponse,
        crate::dto::SkippedSourceResponse,
        crate::dto::SourceListResponse,
        crate::dto::SourceResponse,
        crate::dto::CircuitResponse,
        crate::dto::SourceHealthResponse,
        crate::dto::UpdateSourceRequest,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "search", description = "Aggregated search and progress"),
        (name = "sources", description = "Source administration"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Registers the bearer scheme referenced by the `/v1` paths.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some("Set via the MOTORSIFT_SERVER_API_KEY environment variable."))
                        .build(),
                ),
            );
        }
    }
}
