//! The chunked parallel processor: the scheduling core of a batch.
//!
//! Files are split into provider-sized chunks. Each chunk's files run
//! concurrently with staggered starts; chunks themselves run strictly in
//! order, with the provider's pacing delay in between. Everything that
//! failed the parallel pass gets one more strictly serial attempt in the
//! retry phase. Results are merged into `BatchState` only after a whole
//! chunk has settled, so the state has exactly one logical writer.

use std::{sync::Arc, time::Duration};

use bon::Builder;
use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::services::{
    batch::{BatchContext, BatchHandle, BatchResult, BatchStatus, FailedFile, FileToProcess},
    events::{BatchEvent, SYSTEM_SCOPE},
    provider::{ExtractError, Extraction, ExtractionAdapter},
    storage::{LedgerEntry, ListingInsert, ListingStore, StorageError, UploadLedger, UploadStatus},
};

const SKIP_MESSAGE: &str = "skipped by operator request";

/// Pacing knobs for the scheduling core. Provider limits come from the
/// adapter's profile; these only shape the orchestrator's own delays.
#[derive(Debug, Clone, Builder)]
pub struct ProcessorConfig {
    /// Offset multiplied by a task's position in its chunk, so a chunk
    /// ramps up instead of bursting.
    #[builder(default = Duration::from_millis(150))]
    pub stagger_offset: Duration,
    /// Pause before every retry-phase attempt.
    #[builder(default = Duration::from_secs(2))]
    pub retry_cooldown: Duration,
    /// Overrides the provider's inter-chunk delay when set.
    pub inter_chunk_delay: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("provider rejected the session: {0}")]
    FatalProvider(String),
}

/// Orchestrates one batch end to end against the injected collaborators.
pub struct BatchProcessor {
    adapter: Arc<ExtractionAdapter>,
    ledger: Arc<dyn UploadLedger>,
    listings: Arc<dyn ListingStore>,
    config: ProcessorConfig,
}

impl BatchProcessor {
    pub fn new(
        adapter: Arc<ExtractionAdapter>,
        ledger: Arc<dyn UploadLedger>,
        listings: Arc<dyn ListingStore>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            adapter,
            ledger,
            listings,
            config,
        }
    }

    /// Drive the batch to a terminal status. Per-file failures never bubble
    /// out of here; an `Err` means the orchestration itself broke, in which
    /// case every unresolved file has already been recorded as abandoned.
    pub async fn run(&self, handle: Arc<BatchHandle>) -> Result<(), ProcessorError> {
        {
            let mut state = handle.state();
            debug_assert_eq!(state.status, BatchStatus::Pending);
            state.status = BatchStatus::Processing;
        }
        match self.run_inner(&handle).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(batch = handle.id(), %err, "batch orchestration failed");
                self.abort_batch(&handle, &err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn run_inner(&self, handle: &Arc<BatchHandle>) -> Result<(), ProcessorError> {
        let cancel = handle.cancel_token();
        let total_files = handle.state().files.len();

        if handle.abandon_requested() {
            self.abort_batch(handle, "batch abandoned by caller").await;
            return Ok(());
        }

        let cache_status = self.adapter.negotiate_cache().await;
        handle.events().publish(BatchEvent::Cache {
            status: cache_status.as_str().to_string(),
        });

        // Duplicates are settled up front: zero-cost success records, never
        // submitted to a provider.
        let (dup_files, work_files): (Vec<FileToProcess>, Vec<FileToProcess>) = {
            let state = handle.state();
            state.files.iter().cloned().partition(|file| file.duplicate)
        };
        for file in &dup_files {
            {
                let mut state = handle.state();
                state.skipped_duplicates += 1;
                state.record_result(BatchResult::success(&file.filename, 0, 0));
            }
            handle.events().publish(BatchEvent::Duplicate {
                filename: file.filename.clone(),
            });
        }

        let profile = self.adapter.profile();
        let chunk_size = profile.max_concurrent.get();
        let chunks: Vec<Vec<FileToProcess>> = work_files
            .chunks(chunk_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let total_chunks = chunks.len();
        handle.state().total_chunks = total_chunks;

        for (chunk_index, chunk) in chunks.iter().enumerate() {
            if handle.abandon_requested() {
                self.abort_batch(handle, "batch abandoned by caller").await;
                return Ok(());
            }
            handle.state().current_chunk = chunk_index + 1;
            handle.events().publish(BatchEvent::ChunkStart {
                chunk_index,
                total_chunks,
                files_in_chunk: chunk.len(),
            });

            let (successes, failures) = self.run_chunk(handle, chunk, &cancel).await;
            let success_count = successes.len();
            let failed_count = failures.len();

            self.persist_chunk_successes(handle, successes, total_files)
                .await?;

            let mut fatal: Option<String> = None;
            for (file, err) in failures {
                match err {
                    ExtractError::Aborted => {
                        // Cancellation mid-chunk; the file stays unresolved
                        // and the abandon path accounts for it.
                        debug!(filename = %file.filename, "call aborted by cancellation");
                    }
                    ExtractError::Skipped => {
                        self.settle_skipped(handle, &file).await?;
                    }
                    err if err.is_fatal() => {
                        fatal = Some(err.to_string());
                    }
                    err => {
                        let message = err.to_string();
                        {
                            let mut state = handle.state();
                            state.errors.insert(file.filename.clone(), message.clone());
                            state.retry_queue.push_back(FailedFile {
                                file: file.clone(),
                                last_error: message.clone(),
                                attempts: 1,
                            });
                        }
                        handle.events().publish(BatchEvent::QueuedForRetry {
                            filename: file.filename.clone(),
                            error: message,
                        });
                    }
                }
            }

            handle.events().publish(BatchEvent::ChunkComplete {
                chunk_index,
                success_count,
                failed_count,
            });

            if let Some(message) = fatal {
                return Err(ProcessorError::FatalProvider(message));
            }

            if chunk_index + 1 < total_chunks {
                let pause = self.config.inter_chunk_delay.unwrap_or(profile.delay_between);
                tokio::time::sleep(pause).await;
            }
        }

        self.run_retry_phase(handle, &cancel, total_files).await?;

        if handle.abandon_requested() {
            self.abort_batch(handle, "batch abandoned by caller").await;
            return Ok(());
        }

        let (total_items, total_tokens, skipped_count, failed_count) = {
            let mut state = handle.state();
            debug_assert_eq!(state.results.len(), state.files.len());
            state.status = BatchStatus::Completed;
            let total_items: usize = state.results.iter().map(|result| result.item_count).sum();
            let failed = state
                .results
                .iter()
                .filter(|result| !result.success)
                .count();
            (total_items, state.token_usage, state.skipped_duplicates, failed)
        };
        handle.events().publish(BatchEvent::Complete {
            total_items,
            total_tokens,
            skipped_count,
            failed_count,
        });
        info!(
            batch = handle.id(),
            total_items, total_tokens, skipped_count, failed_count, "batch completed"
        );
        Ok(())
    }

    /// Launch one chunk's files concurrently with staggered starts and wait
    /// for every task to settle. Tasks never propagate errors past their
    /// own boundary; a panicked sibling becomes a typed failure.
    async fn run_chunk(
        &self,
        handle: &Arc<BatchHandle>,
        chunk: &[FileToProcess],
        cancel: &tokio_util::sync::CancellationToken,
    ) -> (
        Vec<(FileToProcess, Extraction)>,
        Vec<(FileToProcess, ExtractError)>,
    ) {
        type TaskResult = (FileToProcess, Result<Extraction, ExtractError>);
        let mut tasks: Vec<JoinHandle<TaskResult>> = Vec::with_capacity(chunk.len());

        for (position, file) in chunk.iter().enumerate() {
            handle.state().current_index += 1;
            let adapter = Arc::clone(&self.adapter);
            let cancel = cancel.clone();
            let signal = Arc::clone(handle);
            let stagger = self.config.stagger_offset * position as u32;
            let file = file.clone();
            tasks.push(tokio::spawn(async move {
                if !stagger.is_zero() {
                    tokio::time::sleep(stagger).await;
                }
                let outcome = adapter
                    .extract(Arc::clone(&file.bytes), &cancel, || signal.take_skip())
                    .await;
                (file, outcome)
            }));
        }

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (position, task) in tasks.into_iter().enumerate() {
            match task.await {
                Ok((file, Ok(extraction))) => successes.push((file, extraction)),
                Ok((file, Err(err))) => failures.push((file, err)),
                Err(join_err) => {
                    let file = chunk[position].clone();
                    warn!(filename = %file.filename, %join_err, "extraction task did not settle");
                    failures.push((
                        file,
                        ExtractError::Transient(format!("extraction task failed: {join_err}")),
                    ));
                }
            }
        }
        (successes, failures)
    }

    /// Persist a chunk's successes as one grouped write per collaborator,
    /// then merge them into state and emit progress.
    async fn persist_chunk_successes(
        &self,
        handle: &Arc<BatchHandle>,
        successes: Vec<(FileToProcess, Extraction)>,
        total_files: usize,
    ) -> Result<(), ProcessorError> {
        if successes.is_empty() {
            return Ok(());
        }
        let context = handle.state().context.clone();
        let day = Utc::now().date_naive();

        let mut inserts = Vec::new();
        let mut entries = Vec::with_capacity(successes.len());
        for (file, extraction) in &successes {
            for record in &extraction.records {
                inserts.push(ListingInsert {
                    record: record.clone(),
                    source_file: file.filename.clone(),
                    uploader: context.uploader.clone(),
                    partition: context.partition.clone(),
                });
            }
            entries.push(ledger_entry(
                file,
                &context,
                extraction.records.len(),
                extraction.usage.total_tokens,
                UploadStatus::Success,
                None,
                day,
            ));
        }
        self.listings.insert_listings(&inserts).await?;
        self.ledger.record_outcomes(&entries).await?;

        for (file, extraction) in successes {
            let tokens = extraction.usage.total_tokens;
            let item_count = extraction.records.len();
            let index = {
                let mut state = handle.state();
                state.token_usage = state.token_usage.saturating_add(tokens);
                state.record_result(BatchResult::success(&file.filename, item_count, tokens));
                state.terminal_count()
            };
            handle.events().publish(BatchEvent::Progress {
                filename: file.filename,
                item_count,
                token_usage: tokens,
                index,
                total: total_files,
            });
        }
        Ok(())
    }

    /// Strictly serial second pass over the parallel pass's failures, in
    /// original failure order. One more attempt each; failure here is
    /// terminal but never aborts the phase.
    async fn run_retry_phase(
        &self,
        handle: &Arc<BatchHandle>,
        cancel: &tokio_util::sync::CancellationToken,
        total_files: usize,
    ) -> Result<(), ProcessorError> {
        let queued = handle.state().retry_queue.len();
        if queued == 0 || handle.abandon_requested() {
            return Ok(());
        }

        handle.state().retrying = true;
        handle.events().publish(BatchEvent::RetryPhase {
            failed_count: queued,
        });
        let mut recovered = 0usize;
        let mut permanent = 0usize;

        loop {
            if handle.abandon_requested() {
                // Remaining queue entries are unresolved; the abandon path
                // records them.
                break;
            }
            let Some(failed) = handle.state().retry_queue.pop_front() else {
                break;
            };
            if handle.take_skip() {
                self.settle_skipped(handle, &failed.file).await?;
                permanent += 1;
                continue;
            }

            tokio::time::sleep(self.config.retry_cooldown).await;
            handle.events().publish(BatchEvent::Retry {
                filename: failed.file.filename.clone(),
            });
            match self
                .adapter
                .extract_once(Arc::clone(&failed.file.bytes), cancel)
                .await
            {
                Ok(extraction) => {
                    self.persist_chunk_successes(
                        handle,
                        vec![(failed.file.clone(), extraction)],
                        total_files,
                    )
                    .await?;
                    recovered += 1;
                }
                Err(ExtractError::Aborted) => continue,
                Err(err) if err.is_fatal() => {
                    return Err(ProcessorError::FatalProvider(err.to_string()));
                }
                Err(err) => {
                    let message = err.to_string();
                    let context = handle.state().context.clone();
                    self.ledger
                        .record_outcomes(&[ledger_entry(
                            &failed.file,
                            &context,
                            0,
                            0,
                            UploadStatus::Failed,
                            Some(message.clone()),
                            Utc::now().date_naive(),
                        )])
                        .await?;
                    handle
                        .state()
                        .record_result(BatchResult::failure(&failed.file.filename, &message));
                    handle.events().publish(BatchEvent::Error {
                        filename: failed.file.filename.clone(),
                        message,
                    });
                    permanent += 1;
                }
            }
        }

        handle.state().retrying = false;
        handle.events().publish(BatchEvent::RetryComplete {
            recovered_count: recovered,
            permanent_failures: permanent,
        });
        Ok(())
    }

    /// Terminal skip of one file: ledgered as skipped, recorded as a failed
    /// result, reported as a per-file error.
    async fn settle_skipped(
        &self,
        handle: &Arc<BatchHandle>,
        file: &FileToProcess,
    ) -> Result<(), ProcessorError> {
        let context = handle.state().context.clone();
        self.ledger
            .record_outcomes(&[ledger_entry(
                file,
                &context,
                0,
                0,
                UploadStatus::Skipped,
                Some(SKIP_MESSAGE.to_string()),
                Utc::now().date_naive(),
            )])
            .await?;
        handle
            .state()
            .record_result(BatchResult::failure(&file.filename, SKIP_MESSAGE));
        handle.events().publish(BatchEvent::Error {
            filename: file.filename.clone(),
            message: SKIP_MESSAGE.to_string(),
        });
        Ok(())
    }

    /// Terminal abort: every file without a result is ledgered as
    /// abandoned (never as failed), a single system-scoped error event is
    /// emitted, and the batch moves to `Failed`. Best-effort by design so
    /// the original failure is what surfaces.
    async fn abort_batch(&self, handle: &Arc<BatchHandle>, message: &str) {
        let (unresolved, context) = {
            let state = handle.state();
            (state.unresolved_files(), state.context.clone())
        };
        if !unresolved.is_empty() {
            let day = Utc::now().date_naive();
            let entries: Vec<LedgerEntry> = unresolved
                .iter()
                .map(|file| {
                    ledger_entry(
                        file,
                        &context,
                        0,
                        0,
                        UploadStatus::Abandoned,
                        Some(message.to_string()),
                        day,
                    )
                })
                .collect();
            if let Err(err) = self.ledger.record_outcomes(&entries).await {
                warn!(batch = handle.id(), %err, "failed to ledger abandoned files");
            }
        }
        handle.events().publish(BatchEvent::Error {
            filename: SYSTEM_SCOPE.to_string(),
            message: message.to_string(),
        });
        handle.state().status = BatchStatus::Failed;
        info!(
            batch = handle.id(),
            abandoned = unresolved.len(),
            message,
            "batch aborted"
        );
    }
}

fn ledger_entry(
    file: &FileToProcess,
    context: &BatchContext,
    item_count: usize,
    token_cost: u64,
    status: UploadStatus,
    error: Option<String>,
    day: chrono::NaiveDate,
) -> LedgerEntry {
    LedgerEntry {
        filename: file.filename.clone(),
        content_hash: file.content_hash.clone(),
        item_count,
        token_cost,
        status,
        error,
        uploader: context.uploader.clone(),
        partition: context.partition.clone(),
        day,
    }
}
