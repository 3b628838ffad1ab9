//! Disk verification for stored images
//!
//! This module provides functionality for:
//! 1. Scanning an output directory for stored images
//! 2. Re-decoding each written file from disk
//! 3. Deleting files that fail to decode

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::ImageReader;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::scraper::image_store::IMAGE_EXTENSION;

/// Error types for disk verification
#[derive(Error, Debug)]
pub enum DiskVerifierError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Result type for disk verification operations
pub type DiskVerifierResult<T> = Result<T, DiskVerifierError>;

/// File status after verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    /// Decodes as an image
    Ok,
    /// Exists but does not decode; holds the decoder's message
    Corrupt(String),
    /// Could not be opened
    Unreadable(String),
}

/// Outcome of a corruption sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Files that decoded, in input order.
    pub kept: Vec<PathBuf>,
    /// Files that failed to decode and were deleted.
    pub removed: Vec<PathBuf>,
    /// Files that failed to decode but could not be deleted. Not counted as kept.
    pub undeletable: Vec<PathBuf>,
}

/// Lists stored images (`*.jpg`) directly inside `dir`, sorted by file name.
pub fn scan_directory(dir: &Path) -> DiskVerifierResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Err(DiskVerifierError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Directory not found: {}", dir.display()),
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(IMAGE_EXTENSION));
        let is_hidden = path
            .file_name()
            .and_then(|f| f.to_str())
            .is_some_and(|f| f.starts_with('.'));
        if is_image && !is_hidden {
            files.push(path.to_path_buf());
        }
    }

    Ok(files)
}

/// Decodes a file from disk, guessing the format from its content rather than its extension.
pub fn verify_file(path: &Path) -> FileStatus {
    let reader = match ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
        Ok(reader) => reader,
        Err(e) => return FileStatus::Unreadable(e.to_string()),
    };

    if reader.format().is_none() {
        return FileStatus::Corrupt("unrecognized image format".to_string());
    }

    match reader.decode() {
        Ok(_) => FileStatus::Ok,
        Err(e) => FileStatus::Corrupt(e.to_string()),
    }
}

/// Deletes every file that does not decode as an image.
pub fn sweep_corrupt(paths: &[PathBuf]) -> SweepReport {
    info!("Size before removing corrupt images: {}", paths.len());

    let statuses: Vec<FileStatus> = paths.par_iter().map(|p| verify_file(p)).collect();

    let mut report = SweepReport::default();
    for (path, status) in paths.iter().zip(statuses) {
        match status {
            FileStatus::Ok => report.kept.push(path.clone()),
            FileStatus::Corrupt(reason) | FileStatus::Unreadable(reason) => {
                debug!("Removing {}: {}", path.display(), reason);
                match fs::remove_file(path) {
                    Ok(()) => report.removed.push(path.clone()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        warn!("{} vanished before removal", path.display());
                        report.removed.push(path.clone());
                    }
                    Err(e) => {
                        error!("Failed to remove corrupt image {}: {}", path.display(), e);
                        report.undeletable.push(path.clone());
                    }
                }
            }
        }
    }

    info!("Size after removing corrupt images: {}", report.kept.len());
    report
}
