use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use motorsift_client::{AppConfig, EngineBuilder};
use motorsift_core::config::{AdapterKind, SourceConfig};
use motorsift_db::{Database, DatabaseConfig};
use motorsift_server::routes;
use motorsift_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("motorsift=info".parse()?))
        .with_target(false)
        .init();

    let api_key = std::env::var("MOTORSIFT_SERVER_API_KEY")
        .context("MOTORSIFT_SERVER_API_KEY must be set")?;
    let port = std::env::var("MOTORSIFT_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let config = AppConfig::from_env()?;
    let purge_interval = Duration::from_secs(config.engine.cache.purge_interval_secs);
    let local_id = config.engine.scheduler.local_source_id.clone();
    let mut builder = EngineBuilder::new(config);

    let database = match DatabaseConfig::from_env_optional()? {
        Some(db_config) => {
            let db = Database::connect(&db_config).await?;
            db.migrate().await?;
            Some(db)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, durable cache and local listings disabled");
            None
        }
    };

    if let Some(db) = &database {
        let listings = Arc::new(db.listing_repo().with_source_id(local_id.clone()));
        builder = builder
            .with_durable_cache(Arc::new(db.cache_repo()))
            .with_listing_store(listings.clone())
            .with_source(SourceConfig::new(local_id, AdapterKind::Api), listings);
    }

    let engine = builder.build().await?;
    let aggregator = Arc::clone(engine.aggregator());

    let cancel = CancellationToken::new();
    let maintenance = tokio::spawn({
        let aggregator = Arc::clone(&aggregator);
        let cancel = cancel.clone();
        async move { aggregator.run_maintenance(purge_interval, cancel).await }
    });

    let state = Arc::new(AppState {
        aggregator,
        api_key,
        database,
    });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    if let Err(e) = maintenance.await {
        tracing::warn!(error = %e, "Maintenance task ended abnormally");
    }
    engine.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for CTRL+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
