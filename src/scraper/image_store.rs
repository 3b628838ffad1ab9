//! Persisting the cleaned image set.
//!
//! Files are named by their position in the set, zero-padded to [`INDEX_WIDTH`] digits, so a
//! directory listing sorts in set order.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::scraper::Payload;

/// Extension of stored files.
pub const IMAGE_EXTENSION: &str = "jpg";

/// Digits in a stored file's index.
pub const INDEX_WIDTH: usize = 4;

/// Largest index that still fits in [`INDEX_WIDTH`] digits.
pub const MAX_FIXED_WIDTH_INDEX: usize = 9_999;

/// Error types for storing images
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to create output directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Output path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// File name for the image at `index`.
pub fn file_name(index: usize) -> String {
    format!("{:0width$}.{}", index, IMAGE_EXTENSION, width = INDEX_WIDTH)
}

/// Creates `dir` (and parents) if needed.
pub fn ensure_directory(dir: &Path) -> StoreResult<()> {
    if dir.exists() && !dir.is_dir() {
        return Err(StoreError::NotADirectory(dir.to_path_buf()));
    }
    fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// Writes every payload to `<dir>/<index>.jpg` and returns the paths in set order.
///
/// Any I/O failure aborts the batch. Files written before the failure are left in place.
#[instrument(skip(payloads), fields(count = payloads.len(), dir = %dir.display()))]
pub fn persist(payloads: &[Payload], dir: &Path) -> StoreResult<Vec<PathBuf>> {
    ensure_directory(dir)?;

    if payloads.len() > MAX_FIXED_WIDTH_INDEX + 1 {
        warn!(
            "{} images exceed {} fixed-width indices; names past {} will not sort lexicographically",
            payloads.len(),
            MAX_FIXED_WIDTH_INDEX + 1,
            file_name(MAX_FIXED_WIDTH_INDEX)
        );
    }

    let mut file_paths = Vec::with_capacity(payloads.len());
    for (index, payload) in payloads.iter().enumerate() {
        let path = dir.join(file_name(index));
        write_atomically(&path, payload).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        debug!(bytes = payload.len(), "Saved {}", path.display());
        file_paths.push(path);
    }

    info!("Saved {} images to {}", file_paths.len(), dir.display());
    Ok(file_paths)
}

/// Writes to a hidden sibling first and renames it into place, so the final name only ever
/// holds a complete file.
fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"))?;
    let temp_path = path.with_file_name(format!(".{}.part", file_name));

    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if result.is_err() && temp_path.exists() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}
