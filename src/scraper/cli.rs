//! Command line surface.
//!
//! Flags override values loaded from the config file; anything left unset keeps the file's
//! value. The file's defaults match a bare run with no config file.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::scraper::query_resolver::parse_lines;
use crate::scraper::{AppConfig, ConfigResult, DedupStrategy, ValidationMode};

#[derive(Parser, Debug)]
#[command(
    name = "image_scraper",
    version,
    about = "Download, de-duplicate and store images for search queries",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// Directory holding image_scraper.toml (default: current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve, download, clean and store images (default)
    Run(RunArgs),
    /// Print the resolved image URLs without downloading
    Resolve(QueryArgs),
    /// Delete undecodable images from an existing output directory
    Sweep {
        /// Directory to sweep (default: configured output directory)
        dir: Option<PathBuf>,
    },
    /// Write a default config file
    InitConfig,
}

#[derive(Args, Debug, Default, Clone)]
pub struct QueryArgs {
    /// Search query; repeat for several. Replaces the configured list.
    #[arg(short, long = "query")]
    pub queries: Vec<String>,

    /// File with one query per line. Replaces the configured list.
    #[arg(long)]
    pub queries_file: Option<PathBuf>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub query: QueryArgs,

    /// File with one image URL per line; skips query resolution
    #[arg(long)]
    pub urls_file: Option<PathBuf>,

    /// Where images are stored [default: data next to the executable]
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Seconds to wait for a single download [default: 45]
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Downloads in flight at once [default: 1]
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Extra attempts per failed download [default: 0]
    #[arg(long)]
    pub retries: Option<usize>,

    /// Duplicate detection strategy [default: exact]
    #[arg(long, value_enum)]
    pub dedup: Option<DedupStrategy>,

    /// Where undecodable images are caught [default: sweep]
    #[arg(long, value_enum)]
    pub validation: Option<ValidationMode>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

impl QueryArgs {
    /// Replaces the configured queries when any were given on the command line.
    pub fn apply(&self, config: &mut AppConfig) -> ConfigResult<()> {
        let mut queries = self.queries.clone();
        if let Some(path) = &self.queries_file {
            queries.extend(parse_lines(&std::fs::read_to_string(path)?));
        }
        if !queries.is_empty() {
            config.queries = queries;
        }
        Ok(())
    }
}

impl RunArgs {
    pub fn apply(&self, config: &mut AppConfig) -> ConfigResult<()> {
        self.query.apply(config)?;

        if let Some(dir) = &self.output_dir {
            config.paths.output_directory = dir.to_string_lossy().to_string();
        }
        if let Some(timeout) = self.timeout_secs {
            config.fetch.timeout_secs = timeout;
        }
        if let Some(concurrency) = self.concurrency {
            config.fetch.concurrency = concurrency;
        }
        if let Some(retries) = self.retries {
            config.fetch.retry_attempts = retries;
        }
        if let Some(dedup) = self.dedup {
            config.cleaning.dedup_strategy = dedup;
        }
        if let Some(validation) = self.validation {
            config.cleaning.validation = validation;
        }

        config.validate()
    }
}
