pub mod classifier;
pub mod config;
pub mod detail_fetcher;
pub mod extractor;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod scraper;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::AppConfig;
pub use pipeline::{Pipeline, PipelineOutcome, PipelineReport};
pub use store::{ProductStore, SqliteProductStore};
pub use utils::error::AppError;

pub type Result<T> = std::result::Result<T, AppError>;
