pub mod config;
pub mod db;
pub mod distance;
mod engine;
pub mod error;
pub mod index;
pub mod knn;
pub mod metrics;
pub mod output;
pub mod query;
pub mod session;

pub use config::{EngineConfig, SearchConfig, StoreConfig, Strategy};
pub use db::{CellId, CellMetadata, CellRecord, FeatureStore, FeatureVector, MemoryStore, RetryPolicy, SqliteStore};
pub use distance::{MetricKind, distance};
pub use engine::{CellSearchEngine, EngineBuilder, IndexReport};
pub use error::{Error, Result, StoreErrorKind};
pub use index::IndexState;
pub use output::{OutputFormat, OutputOptions};
pub use query::{MatchResult, SearchMode, SearchQuery};
pub use tokio_util::sync::CancellationToken;
