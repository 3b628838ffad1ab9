//! Pipeline orchestration: resolve, fetch, clean, persist, sweep.
//!
//! Each stage runs to completion before the next begins. Only storage errors abort a run;
//! every per-item failure is absorbed by the stage that sees it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::{JoinError, spawn_blocking};
use tracing::{Instrument, Span, info, info_span};
use uuid::Uuid;

use crate::scraper::Payload;
use crate::scraper::cleaner::{DedupStrategy, deduplicate, remove_absent, remove_corrupt};
use crate::scraper::disk_verifier::sweep_corrupt;
use crate::scraper::download_engine::{DownloadEngine, DownloadEngineConfig, DownloadStats, Source};
use crate::scraper::image_store::{StoreError, persist};
use crate::scraper::query_resolver::{Resolver, resolve_all};

/// Where undecodable images are caught. A run uses exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Write everything, then decode each file from disk and delete failures.
    Sweep,
    /// Decode in memory and drop failures before anything is written.
    InMemory,
    /// Store whatever survives deduplication.
    Off,
}

/// Error types for a pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Cleaning task failed: {0}")]
    Task(#[from] JoinError),
}

/// Result type for pipeline runs
pub type PipelineResult<T> = Result<T, PipelineError>;

/// A locator whose slot ended up absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFetch {
    pub locator: String,
    pub attempts: usize,
    pub error: String,
}

/// Counts per stage of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_directory: PathBuf,
    pub locators: usize,
    pub fetched: usize,
    pub fetch_failed: usize,
    pub bytes_downloaded: u64,
    /// In input order.
    pub failed: Vec<FailedFetch>,
    pub after_presence_filter: usize,
    pub after_dedup: usize,
    /// `None` unless validation ran in memory.
    pub after_in_memory_validation: Option<usize>,
    pub written: usize,
    /// `None` unless the post-write sweep ran.
    pub removed_by_sweep: Option<usize>,
    pub stored: Vec<PathBuf>,
}

impl RunReport {
    pub fn stored_count(&self) -> usize {
        self.stored.len()
    }
}

/// Options that shape a run, independent of where locators come from.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub output_directory: PathBuf,
    pub fetch: DownloadEngineConfig,
    pub dedup: DedupStrategy,
    pub validation: ValidationMode,
}

/// Counts from the stages after the fetch.
struct StoreSummary {
    after_presence_filter: usize,
    after_dedup: usize,
    after_in_memory_validation: Option<usize>,
    written: usize,
    removed_by_sweep: Option<usize>,
    stored: Vec<PathBuf>,
}

/// Runs the acquisition-and-cleaning pipeline over a [`Source`].
pub struct Pipeline<S> {
    engine: DownloadEngine<S>,
    options: PipelineOptions,
}

impl<S: Source> Pipeline<S> {
    pub fn new(options: PipelineOptions, source: S) -> Self {
        let engine = DownloadEngine::new(options.fetch.clone(), source);
        Self { engine, options }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.engine = self.engine.with_progress(progress);
        self
    }

    /// Resolves every query, then runs the remaining stages on the combined locators.
    pub async fn run<R: Resolver>(&self, resolver: &R, queries: &[String]) -> PipelineResult<RunReport> {
        info!("Resolving {} queries", queries.len());
        let locators = resolve_all(resolver, queries).await;
        self.run_locators(&locators).await
    }

    /// Fetches, cleans and stores the given locators.
    pub async fn run_locators(&self, locators: &[String]) -> PipelineResult<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        self.run_inner(run_id, locators).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, locators: &[String]) -> PipelineResult<RunReport> {
        let started_at = Utc::now();
        let dir = self.options.output_directory.clone();

        let outcomes = self.engine.fetch(locators).await;
        let stats = DownloadStats::from_outcomes(&outcomes);

        let mut failed = Vec::new();
        let mut slots = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            if let Err(e) = &outcome.result {
                failed.push(FailedFetch {
                    locator: outcome.locator.clone(),
                    attempts: outcome.attempts,
                    error: e.to_string(),
                });
            }
            slots.push(outcome.into_slot());
        }

        // Decoding, hashing and file IO run on the blocking pool
        let (dedup, validation) = (self.options.dedup, self.options.validation);
        let span = Span::current();
        let summary = {
            let dir = dir.clone();
            spawn_blocking(move || span.in_scope(|| clean_and_store(slots, dedup, validation, &dir)))
                .await??
        };

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            output_directory: dir,
            locators: locators.len(),
            fetched: stats.completed_jobs,
            fetch_failed: stats.failed_jobs,
            bytes_downloaded: stats.bytes_downloaded,
            failed,
            after_presence_filter: summary.after_presence_filter,
            after_dedup: summary.after_dedup,
            after_in_memory_validation: summary.after_in_memory_validation,
            written: summary.written,
            removed_by_sweep: summary.removed_by_sweep,
            stored: summary.stored,
        };

        info!(
            "Run finished: {} locators, {} fetched, {} unique, {} stored in {}",
            report.locators,
            report.fetched,
            report.after_dedup,
            report.stored_count(),
            report.output_directory.display()
        );

        Ok(report)
    }
}

fn clean_and_store(
    slots: Vec<Option<Payload>>,
    dedup: DedupStrategy,
    validation: ValidationMode,
    dir: &Path,
) -> PipelineResult<StoreSummary> {
    let present = remove_absent(slots);
    let after_presence_filter = present.len();

    let mut image_set = deduplicate(&present, dedup);
    drop(present);
    let after_dedup = image_set.len();

    let mut after_in_memory_validation = None;
    if validation == ValidationMode::InMemory {
        image_set = remove_corrupt(&image_set);
        after_in_memory_validation = Some(image_set.len());
    }

    let written = persist(&image_set, dir)?;

    let (stored, removed_by_sweep) = match validation {
        ValidationMode::Sweep => {
            let report = sweep_corrupt(&written);
            let removed = report.removed.len() + report.undeletable.len();
            (report.kept, Some(removed))
        }
        ValidationMode::InMemory | ValidationMode::Off => (written.clone(), None),
    };

    Ok(StoreSummary {
        after_presence_filter,
        after_dedup,
        after_in_memory_validation,
        written: written.len(),
        removed_by_sweep,
        stored,
    })
}
