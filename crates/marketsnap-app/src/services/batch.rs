//! Batch lifecycle state and the process-wide batch registry.
//!
//! A `BatchState` is exclusively owned by the orchestrator; external callers
//! interact only through the signals on `BatchHandle` (abandon, skip) and
//! the event channel. The store is an explicit service passed by reference,
//! never ambient global state.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::services::events::EventChannel;

/// Lifecycle of one batch. Ordinary per-file failures do not move a batch
/// to `Failed`; only full abandonment or an orchestration-level error does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Caller-supplied context attached at submission.
#[derive(Debug, Clone, Default)]
pub struct BatchContext {
    pub uploader: Option<String>,
    pub partition: Option<String>,
}

/// Immutable input descriptor for one uploaded file.
#[derive(Debug, Clone)]
pub struct FileToProcess {
    pub filename: String,
    pub source: PathBuf,
    pub content_hash: String,
    pub duplicate: bool,
    pub bytes: Arc<[u8]>,
}

/// Immutable terminal record for one file. Produced exactly once per file;
/// duplicates get a zero-cost success record.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub filename: String,
    pub item_count: usize,
    pub token_cost: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl BatchResult {
    pub fn success(filename: impl Into<String>, item_count: usize, token_cost: u64) -> Self {
        Self {
            filename: filename.into(),
            item_count,
            token_cost,
            success: true,
            error: None,
        }
    }

    pub fn failure(filename: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            item_count: 0,
            token_cost: 0,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// A file awaiting the serial retry phase.
#[derive(Debug, Clone)]
pub struct FailedFile {
    pub file: FileToProcess,
    pub last_error: String,
    pub attempts: u32,
}

/// Authoritative record of one batch's progress. Mutated only under the
/// handle's lock, and only by orchestrator logic.
#[derive(Debug)]
pub struct BatchState {
    pub id: String,
    pub files: Vec<FileToProcess>,
    pub status: BatchStatus,
    pub current_index: usize,
    pub results: Vec<BatchResult>,
    pub errors: HashMap<String, String>,
    pub token_usage: u64,
    pub skipped_duplicates: usize,
    pub retry_queue: VecDeque<FailedFile>,
    pub retrying: bool,
    pub current_chunk: usize,
    pub total_chunks: usize,
    pub context: BatchContext,
}

impl BatchState {
    fn new(id: String, files: Vec<FileToProcess>, context: BatchContext) -> Self {
        Self {
            id,
            files,
            status: BatchStatus::Pending,
            current_index: 0,
            results: Vec::new(),
            errors: HashMap::new(),
            token_usage: 0,
            skipped_duplicates: 0,
            retry_queue: VecDeque::new(),
            retrying: false,
            current_chunk: 0,
            total_chunks: 0,
            context,
        }
    }

    /// Append one terminal result. Failures also land in the error map.
    pub fn record_result(&mut self, result: BatchResult) {
        debug_assert!(self.results.len() < self.files.len());
        debug_assert!(!self.status.is_terminal());
        if let Some(error) = &result.error {
            self.errors.insert(result.filename.clone(), error.clone());
        }
        self.results.push(result);
    }

    /// Files that never reached a terminal result.
    pub fn unresolved_files(&self) -> Vec<FileToProcess> {
        self.files
            .iter()
            .filter(|file| {
                !self
                    .results
                    .iter()
                    .any(|result| result.filename == file.filename)
            })
            .cloned()
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.results.len()
    }
}

/// Shared handle to a running batch: the locked state plus the signals that
/// may be fired asynchronously against it.
pub struct BatchHandle {
    id: String,
    state: Mutex<BatchState>,
    cancel: CancellationToken,
    abandon_requested: AtomicBool,
    skip_requested: AtomicBool,
    events: EventChannel,
}

impl BatchHandle {
    fn new(files: Vec<FileToProcess>, context: BatchContext) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        Arc::new(Self {
            state: Mutex::new(BatchState::new(id.clone(), files, context)),
            id,
            cancel: CancellationToken::new(),
            abandon_requested: AtomicBool::new(false),
            skip_requested: AtomicBool::new(false),
            events: EventChannel::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().expect("batch state lock poisoned")
    }

    pub fn status(&self) -> BatchStatus {
        self.state().status
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Token shared with in-flight provider calls. Once triggered it stays
    /// triggered for the batch's lifetime.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// One-way full cancellation: aborts in-flight adapter calls
    /// immediately, observed by the processor at its checkpoints.
    pub fn request_abandon(&self) {
        self.abandon_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn abandon_requested(&self) -> bool {
        self.abandon_requested.load(Ordering::SeqCst)
    }

    /// Ask the orchestrator to give up on the file currently blocking
    /// forward progress, without cancelling the batch.
    pub fn request_skip(&self) {
        self.skip_requested.store(true, Ordering::SeqCst);
    }

    pub fn skip_requested(&self) -> bool {
        self.skip_requested.load(Ordering::SeqCst)
    }

    /// Consume a pending skip request, returning whether one was set.
    pub fn take_skip(&self) -> bool {
        self.skip_requested.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum BatchStoreError {
    #[error("batch `{0}` not found")]
    NotFound(String),
}

/// Process-wide registry of live batches, keyed by batch id. Eviction is
/// the owner's call; completed batches stay queryable until removed so a
/// reconnecting subscriber can still replay.
#[derive(Default)]
pub struct BatchStore {
    batches: DashMap<String, Arc<BatchHandle>>,
}

impl BatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, files: Vec<FileToProcess>, context: BatchContext) -> Arc<BatchHandle> {
        let handle = BatchHandle::new(files, context);
        self.batches.insert(handle.id().to_string(), Arc::clone(&handle));
        handle
    }

    pub fn get(&self, id: &str) -> Result<Arc<BatchHandle>, BatchStoreError> {
        self.batches
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BatchStoreError::NotFound(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<BatchHandle>> {
        self.batches.remove(id).map(|(_, handle)| handle)
    }

    pub fn abandon(&self, id: &str) -> Result<(), BatchStoreError> {
        self.get(id)?.request_abandon();
        Ok(())
    }

    pub fn skip(&self, id: &str) -> Result<(), BatchStoreError> {
        self.get(id)?.request_skip();
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.batches
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .count()
    }
}
