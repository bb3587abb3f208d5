use std::sync::Arc;

use motorsift_core::scheduler::Aggregator;
use motorsift_db::Database;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    /// Bearer key guarding every `/v1` route.
    pub api_key: String,
    /// Present when the durable tiers are backed by PostgreSQL.
    pub database: Option<Database>,
}
