use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use motorsift_client::{AppConfig, Engine, EngineBuilder};
use motorsift_core::config::{AdapterKind, SourceConfig};
use motorsift_core::models::{SearchRequest, SortOrder};
use motorsift_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "motorsift", version, about = "Multi-source vehicle listing aggregator")]
struct Cli {
    /// Source definitions file
    #[arg(short, long, global = true, env = "MOTORSIFT_CONFIG", default_value = "motorsift.toml")]
    config: PathBuf,

    /// Skip the database even when DATABASE_URL is set
    #[arg(long, global = true, default_value_t = false)]
    no_db: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search every enabled source and print the merged result as JSON
    Search(SearchArgs),

    /// List configured sources with circuit, quota and latency statistics
    Sources {
        /// Also run a health check against every source
        #[arg(long, default_value_t = false)]
        health: bool,
    },
}

#[derive(Args)]
struct SearchArgs {
    /// Free-text query passed through to sources that accept it
    #[arg(short, long)]
    query: Option<String>,

    #[arg(long)]
    make: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    year_min: Option<u16>,

    #[arg(long)]
    year_max: Option<u16>,

    #[arg(long)]
    price_min: Option<u32>,

    #[arg(long)]
    price_max: Option<u32>,

    #[arg(long)]
    mileage_min: Option<u32>,

    #[arg(long)]
    mileage_max: Option<u32>,

    #[arg(long)]
    body_style: Option<String>,

    /// Restrict the search to these sources (repeatable)
    #[arg(short, long = "source")]
    sources: Vec<String>,

    #[arg(long, default_value_t = 1)]
    page: u32,

    #[arg(long, default_value_t = motorsift_core::models::DEFAULT_PAGE_SIZE)]
    page_size: u32,

    #[arg(long, value_enum)]
    sort: Option<SortArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Relevance,
    PriceAsc,
    PriceDesc,
    YearDesc,
    MileageAsc,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Relevance => SortOrder::Relevance,
            SortArg::PriceAsc => SortOrder::PriceAsc,
            SortArg::PriceDesc => SortOrder::PriceDesc,
            SortArg::YearDesc => SortOrder::YearDesc,
            SortArg::MileageAsc => SortOrder::MileageAsc,
        }
    }
}

impl SearchArgs {
    fn into_request(self) -> SearchRequest {
        let mut request = SearchRequest::new()
            .with_years(self.year_min, self.year_max)
            .with_price_range(self.price_min, self.price_max)
            .with_mileage_range(self.mileage_min, self.mileage_max)
            .with_page(self.page, self.page_size);
        if let Some(query) = self.query {
            request = request.with_query(query);
        }
        if let Some(make) = self.make {
            request = request.with_make(make);
        }
        if let Some(model) = self.model {
            request = request.with_model(model);
        }
        if let Some(body_style) = self.body_style {
            request = request.with_body_style(body_style);
        }
        if !self.sources.is_empty() {
            request = request.with_sources(self.sources);
        }
        if let Some(sort) = self.sort {
            request = request.with_sort(sort.into());
        }
        request
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("motorsift=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)
        .and_then(AppConfig::with_env_overrides)
        .map_err(|e| anyhow::anyhow!(e))?;
    let engine = build_engine(config, cli.no_db).await?;

    let outcome = match cli.command {
        Commands::Search(args) => cmd_search(&engine, args.into_request()).await,
        Commands::Sources { health } => cmd_sources(&engine, health).await,
    };

    engine.shutdown().await;
    outcome
}

/// Build the engine, attaching the database tiers when `DATABASE_URL` is set.
async fn build_engine(config: AppConfig, no_db: bool) -> Result<Engine> {
    let local_id = config.engine.scheduler.local_source_id.clone();
    let mut builder = EngineBuilder::new(config);

    let db_config = if no_db {
        None
    } else {
        DatabaseConfig::from_env_optional().map_err(|e| anyhow::anyhow!(e))?
    };

    if let Some(db_config) = db_config {
        let db = Database::connect(&db_config)
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to connect to database")?;
        db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;

        let listings = Arc::new(db.listing_repo().with_source_id(local_id.clone()));
        builder = builder
            .with_durable_cache(Arc::new(db.cache_repo()))
            .with_listing_store(listings.clone())
            .with_source(SourceConfig::new(local_id, AdapterKind::Api), listings);
    } else {
        tracing::info!("No database configured, running with the in-process cache only");
    }

    builder.build().await.map_err(|e| anyhow::anyhow!(e))
}

async fn cmd_search(engine: &Engine, request: SearchRequest) -> Result<()> {
    let result = engine
        .aggregator()
        .search(&request)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(
        total = result.total,
        succeeded = result.sources_succeeded.len(),
        failed = result.sources_failed.len(),
        skipped = result.sources_skipped.len(),
        cached = result.cached,
        elapsed_ms = result.elapsed_ms,
        "Search complete"
    );
    if result.partial {
        tracing::warn!("Results may be incomplete: some sources failed or were skipped");
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_sources(engine: &Engine, health: bool) -> Result<()> {
    let aggregator = engine.aggregator();
    let stats = aggregator.source_stats();

    if stats.is_empty() {
        println!("No sources configured");
        return Ok(());
    }

    let output = if health {
        serde_json::json!({
            "sources": stats,
            "health": aggregator.health_check_all().await,
        })
    } else {
        serde_json::json!({ "sources": stats })
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
