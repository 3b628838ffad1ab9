//! Image acquisition pipeline
//! Resolves queries to image URLs, downloads them, cleans the set and stores it on disk

pub mod cleaner;
pub mod cli;
pub mod config_loader;
pub mod disk_verifier;
pub mod download_engine;
pub mod image_store;
pub mod logger;
pub mod orchestration;
pub mod payload;
pub mod query_resolver;
pub(crate) mod tui;

pub use payload::Payload;

// Re-export commonly used types for convenience
pub use config_loader::{AppConfig, ConfigManager, ConfigResult};

pub use cleaner::DedupStrategy;

pub use download_engine::{DownloadEngineConfig, HttpSource};

pub use disk_verifier::{scan_directory, sweep_corrupt};

pub use query_resolver::{SearchPageResolver, resolve_all};

pub use orchestration::{Pipeline, PipelineOptions, RunReport, ValidationMode};

pub use logger::{Logger, init_logger};

pub use cli::{Cli, Commands};
