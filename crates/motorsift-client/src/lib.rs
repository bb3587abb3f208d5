pub mod api;
#[cfg(feature = "browser")]
pub mod browser;
pub mod definition;
pub mod engine;
pub mod scrape;

pub use api::{ApiSourceSpec, HttpApiAdapter};
#[cfg(feature = "browser")]
pub use browser::{BrowserSessionManager, ScrapedSource};
pub use definition::{AppConfig, SourceDefinition};
pub use engine::{Engine, EngineBuilder};
pub use scrape::{ScrapeSpec, SelectorParser};
