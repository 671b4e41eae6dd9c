//! File intake and day-scoped deduplication against the upload ledger.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::NaiveDate;
use thiserror::Error;
use tracing::debug;

use crate::services::{
    batch::FileToProcess,
    storage::{StorageError, UploadLedger},
};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("failed to read upload {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("upload path has no usable filename: {path}")]
    MissingFilename { path: PathBuf },
    #[error("upload {path} is empty")]
    EmptyFile { path: PathBuf },
}

/// Hex blake3 digest of a file's content; the dedup key.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Read one upload from disk into an immutable descriptor. The duplicate
/// flag starts false and is set by [`DedupFilter::mark_duplicates`].
pub async fn intake_file(path: &Path) -> Result<FileToProcess, IntakeError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| IntakeError::MissingFilename {
            path: path.to_path_buf(),
        })?;
    let bytes = tokio::fs::read(path).await.map_err(|source| IntakeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(IntakeError::EmptyFile {
            path: path.to_path_buf(),
        });
    }
    let hash = content_hash(&bytes);
    Ok(FileToProcess {
        filename,
        source: path.to_path_buf(),
        content_hash: hash,
        duplicate: false,
        bytes: Arc::from(bytes.into_boxed_slice()),
    })
}

pub async fn intake_files(paths: &[PathBuf]) -> Result<Vec<FileToProcess>, IntakeError> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(intake_file(path).await?);
    }
    Ok(files)
}

/// Read-only check against the ledger: a file is a duplicate when a prior
/// successful upload with the same hash exists on the same calendar day.
pub struct DedupFilter {
    ledger: Arc<dyn UploadLedger>,
}

impl DedupFilter {
    pub fn new(ledger: Arc<dyn UploadLedger>) -> Self {
        Self { ledger }
    }

    /// Set the duplicate flag on each file, returning how many matched.
    /// Duplicates still count toward batch totals but never reach a
    /// provider.
    pub async fn mark_duplicates(
        &self,
        files: &mut [FileToProcess],
        day: NaiveDate,
    ) -> Result<usize, StorageError> {
        let mut matched = 0usize;
        for file in files.iter_mut() {
            file.duplicate = self
                .ledger
                .has_successful_upload(&file.content_hash, day)
                .await?;
            if file.duplicate {
                matched += 1;
                debug!(filename = %file.filename, "upload already seen today");
            }
        }
        Ok(matched)
    }
}
