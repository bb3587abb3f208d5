pub mod cache_repository;
pub mod config;
pub mod database;
pub mod listing_repository;

pub use cache_repository::CacheRepository;
pub use config::DatabaseConfig;
pub use database::Database;
pub use listing_repository::ListingRepository;
