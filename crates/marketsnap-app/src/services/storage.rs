//! Collaborator interfaces for persisted state: the upload-history ledger
//! and the listing store. The orchestrator only ever talks to these traits;
//! chunk grouping is expressed as slice-level calls so a backend can commit
//! one chunk atomically.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::provider::ListingRecord;

/// Terminal ledger status of one upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadStatus {
    Success,
    Failed,
    Skipped,
    Abandoned,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Abandoned => "abandoned",
        }
    }
}

/// One row of the upload-history ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub filename: String,
    pub content_hash: String,
    pub item_count: usize,
    pub token_cost: u64,
    pub status: UploadStatus,
    pub error: Option<String>,
    pub uploader: Option<String>,
    pub partition: Option<String>,
    pub day: NaiveDate,
}

/// One extracted listing bound for the listing store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingInsert {
    pub record: ListingRecord,
    pub source_file: String,
    pub uploader: Option<String>,
    pub partition: Option<String>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Persisted record of past upload attempts; also answers day-scoped
/// duplicate queries.
#[async_trait]
pub trait UploadLedger: Send + Sync {
    /// Whether a prior successful upload with this hash exists on the given
    /// calendar day.
    async fn has_successful_upload(&self, hash: &str, day: NaiveDate)
    -> Result<bool, StorageError>;

    /// Record a group of terminal outcomes. A slice is one atomic write;
    /// the processor passes a whole chunk at a time.
    async fn record_outcomes(&self, entries: &[LedgerEntry]) -> Result<(), StorageError>;
}

/// Destination for extracted listings; one call covers one chunk's
/// successes and commits together.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn insert_listings(&self, inserts: &[ListingInsert]) -> Result<(), StorageError>;
}

/// In-memory ledger used by tests and local runs.
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().expect("ledger lock poisoned").clone()
    }
}

#[async_trait]
impl UploadLedger for MemoryLedger {
    async fn has_successful_upload(
        &self,
        hash: &str,
        day: NaiveDate,
    ) -> Result<bool, StorageError> {
        let entries = self.entries.lock().expect("ledger lock poisoned");
        Ok(entries.iter().any(|entry| {
            entry.content_hash == hash && entry.day == day && entry.status == UploadStatus::Success
        }))
    }

    async fn record_outcomes(&self, new_entries: &[LedgerEntry]) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().expect("ledger lock poisoned");
        entries.extend_from_slice(new_entries);
        Ok(())
    }
}

/// In-memory listing store used by tests and local runs.
#[derive(Default)]
pub struct MemoryListingStore {
    rows: Mutex<Vec<ListingInsert>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<ListingInsert> {
        self.rows.lock().expect("listing lock poisoned").clone()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn insert_listings(&self, inserts: &[ListingInsert]) -> Result<(), StorageError> {
        let mut rows = self.rows.lock().expect("listing lock poisoned");
        rows.extend_from_slice(inserts);
        Ok(())
    }
}
