pub mod crawler;
pub mod error;
pub mod model;
pub mod source;
pub mod store;
pub mod validate;

pub use crawler::{CancelFlag, Crawler, ProgressCallback, RetryPolicy};
pub use error::{CrawlError, SourceError, StoreError};
pub use source::{ProfileSource, SteamSource};
pub use store::{GraphStore, JobStore, MemoryStore, ProfileStore, Store};
