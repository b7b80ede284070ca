pub mod aggregate;
pub mod config;
pub mod crawl;
pub mod data;
pub mod error;
pub mod report;

pub use config::{Config, ConfigError, LogFormat};
pub use crawl::{CrawlOptions, CrawlRequest, CrawlService, CrawlTicket};
pub use data::{Database, SqliteStore};
pub use error::CoreError;
