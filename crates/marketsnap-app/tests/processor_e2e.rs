//! End-to-end runs of the batch processor against scripted providers and
//! in-memory stores. Delays are shrunk to keep the suite fast; the
//! scheduling shape is asserted through the event log and the stores.

use std::{
    collections::{HashMap, VecDeque},
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use marketsnap_app::services::{
    AdapterConfig, BatchContext, BatchEvent, BatchProcessor, BatchStatus, BatchStore, CacheStatus,
    ExtractError, Extraction, ExtractionAdapter, FileToProcess, ListingRecord, MemoryLedger,
    MemoryListingStore, ProcessorConfig, ProviderKind, ProviderProfile, StoredEvent, TokenUsage,
    UploadStatus, VisionClient,
};
use tokio_util::sync::CancellationToken;

/// Scripted provider: outcomes are keyed by the image bytes, so each file
/// carries its own script. Unscripted files succeed with one record.
struct ScriptedVision {
    scripts: Mutex<HashMap<Vec<u8>, VecDeque<Result<Extraction, ExtractError>>>>,
    calls: AtomicUsize,
    cache: CacheStatus,
}

impl ScriptedVision {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            cache: CacheStatus::Created,
        }
    }

    fn script(self, file: &FileToProcess, outcomes: Vec<Result<Extraction, ExtractError>>) -> Self {
        self.scripts
            .lock()
            .expect("script lock")
            .insert(file.bytes.to_vec(), outcomes.into());
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionClient for ScriptedVision {
    async fn extract(
        &self,
        image: Arc<[u8]>,
        _cancel: &CancellationToken,
    ) -> Result<Extraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .scripts
            .lock()
            .expect("script lock")
            .get_mut(image.as_ref())
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(extraction(1, 100)))
    }

    async fn ensure_prompt_cache(&self) -> CacheStatus {
        self.cache
    }
}

/// Provider that abandons its own batch on first contact and then waits for
/// the cancellation it caused.
struct AbandoningVision {
    store: Arc<BatchStore>,
    batch_id: Mutex<String>,
}

#[async_trait]
impl VisionClient for AbandoningVision {
    async fn extract(
        &self,
        _image: Arc<[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Extraction, ExtractError> {
        let id = self.batch_id.lock().expect("id lock").clone();
        self.store.abandon(&id).expect("batch registered");
        cancel.cancelled().await;
        Err(ExtractError::Aborted)
    }
}

fn extraction(items: usize, tokens: u64) -> Extraction {
    let records = (0..items)
        .map(|i| ListingRecord {
            item_name: format!("iron ore {i}"),
            quantity: 10,
            unit_price: 25,
            total_price: 250,
            category: Some("materials".to_string()),
        })
        .collect();
    Extraction {
        records,
        usage: TokenUsage {
            prompt_tokens: tokens / 2,
            completion_tokens: tokens - tokens / 2,
            total_tokens: tokens,
        },
    }
}

fn file(name: &str) -> FileToProcess {
    FileToProcess {
        filename: name.to_string(),
        source: PathBuf::from(name),
        content_hash: format!("hash-{name}"),
        duplicate: false,
        bytes: Arc::from(name.as_bytes()),
    }
}

fn duplicate(name: &str) -> FileToProcess {
    FileToProcess {
        duplicate: true,
        ..file(name)
    }
}

struct Harness {
    store: Arc<BatchStore>,
    ledger: Arc<MemoryLedger>,
    listings: Arc<MemoryListingStore>,
    processor: BatchProcessor,
}

fn harness(kind: ProviderKind, client: Arc<dyn VisionClient>) -> Harness {
    harness_with(kind, client, None)
}

/// Like [`harness`] but the provider profile is pinned to one call at a
/// time, so chunk sizing is under test control instead of the provider's
/// declared limits.
fn serial_harness(client: Arc<dyn VisionClient>) -> Harness {
    let profile = ProviderProfile {
        max_concurrent: NonZeroUsize::new(1).expect("non-zero"),
        delay_between: Duration::from_millis(1),
        requests_per_second: NonZeroU32::new(1_000).expect("non-zero"),
    };
    harness_with(ProviderKind::Gemini, client, Some(profile))
}

fn harness_with(
    kind: ProviderKind,
    client: Arc<dyn VisionClient>,
    profile: Option<ProviderProfile>,
) -> Harness {
    let adapter = Arc::new(ExtractionAdapter::new(
        kind,
        client,
        AdapterConfig::builder()
            .base_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .maybe_profile(profile)
            .build(),
    ));
    let ledger = Arc::new(MemoryLedger::new());
    let listings = Arc::new(MemoryListingStore::new());
    let processor = BatchProcessor::new(
        adapter,
        Arc::clone(&ledger) as _,
        Arc::clone(&listings) as _,
        ProcessorConfig::builder()
            .stagger_offset(Duration::from_millis(1))
            .retry_cooldown(Duration::from_millis(1))
            .inter_chunk_delay(Duration::from_millis(1))
            .build(),
    );
    Harness {
        store: Arc::new(BatchStore::new()),
        ledger,
        listings,
        processor,
    }
}

fn event_kinds(events: &[StoredEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|stored| match &stored.event {
            BatchEvent::Progress { .. } => "progress",
            BatchEvent::Duplicate { .. } => "duplicate",
            BatchEvent::ChunkStart { .. } => "chunk-start",
            BatchEvent::ChunkComplete { .. } => "chunk-complete",
            BatchEvent::QueuedForRetry { .. } => "queued-for-retry",
            BatchEvent::RetryPhase { .. } => "retry-phase",
            BatchEvent::Retry { .. } => "retry",
            BatchEvent::RetryComplete { .. } => "retry-complete",
            BatchEvent::Cache { .. } => "cache",
            BatchEvent::Error { .. } => "error",
            BatchEvent::Complete { .. } => "complete",
        })
        .collect()
}

#[tokio::test]
async fn five_files_run_in_ordered_chunks() {
    let client = Arc::new(ScriptedVision::new());
    let h = harness(ProviderKind::Gemini, Arc::clone(&client) as _);
    let files: Vec<_> = (0..5).map(|i| file(&format!("shot-{i}.png"))).collect();
    let handle = h.store.create(files, BatchContext::default());

    h.processor
        .run(Arc::clone(&handle))
        .await
        .expect("batch runs");

    assert_eq!(handle.status(), BatchStatus::Completed);
    assert_eq!(client.calls(), 5);
    {
        let state = handle.state();
        assert_eq!(state.results.len(), 5);
        assert!(state.results.iter().all(|result| result.success));
        assert_eq!(state.token_usage, 500);
        assert_eq!(state.total_chunks, 2);
        assert_eq!(state.current_chunk, 2);
        assert!(state.retry_queue.is_empty());
    }

    let entries = h.ledger.entries();
    assert_eq!(entries.len(), 5);
    assert!(entries
        .iter()
        .all(|entry| entry.status == UploadStatus::Success));
    assert_eq!(h.listings.rows().len(), 5);

    // Gemini chunks three at a time: cache, then two chunk envelopes with
    // their progress inside, then completion.
    let kinds = event_kinds(&handle.events().snapshot());
    assert_eq!(
        kinds,
        vec![
            "cache",
            "chunk-start",
            "progress",
            "progress",
            "progress",
            "chunk-complete",
            "chunk-start",
            "progress",
            "progress",
            "chunk-complete",
            "complete",
        ]
    );
}

#[tokio::test]
async fn concurrency_of_one_processes_strictly_in_input_order() {
    let client = Arc::new(ScriptedVision::new());
    let h = serial_harness(Arc::clone(&client) as _);
    let names: Vec<String> = (0..4).map(|i| format!("shot-{i}.png")).collect();
    let files: Vec<_> = names.iter().map(|name| file(name)).collect();
    let handle = h.store.create(files, BatchContext::default());

    h.processor
        .run(Arc::clone(&handle))
        .await
        .expect("batch runs");

    assert_eq!(handle.status(), BatchStatus::Completed);
    assert_eq!(client.calls(), 4);

    // Single-call profile: every chunk holds exactly one file and settles
    // before the next begins, so results land in input order.
    {
        let state = handle.state();
        assert_eq!(state.total_chunks, 4);
        let settled: Vec<&str> = state
            .results
            .iter()
            .map(|result| result.filename.as_str())
            .collect();
        let expected: Vec<&str> = names.iter().map(String::as_str).collect();
        assert_eq!(settled, expected);
    }

    let stored: Vec<String> = h
        .listings
        .rows()
        .iter()
        .map(|row| row.source_file.clone())
        .collect();
    assert_eq!(stored, names);

    let kinds = event_kinds(&handle.events().snapshot());
    assert_eq!(
        kinds,
        vec![
            "cache",
            "chunk-start",
            "progress",
            "chunk-complete",
            "chunk-start",
            "progress",
            "chunk-complete",
            "chunk-start",
            "progress",
            "chunk-complete",
            "chunk-start",
            "progress",
            "chunk-complete",
            "complete",
        ]
    );
}

#[tokio::test]
async fn seven_files_split_into_two_full_chunks_and_a_tail() {
    let client = Arc::new(ScriptedVision::new());
    let h = harness(ProviderKind::Gemini, Arc::clone(&client) as _);
    let files: Vec<_> = (0..7).map(|i| file(&format!("shot-{i}.png"))).collect();
    let handle = h.store.create(files, BatchContext::default());

    h.processor
        .run(Arc::clone(&handle))
        .await
        .expect("batch runs");

    assert_eq!(handle.status(), BatchStatus::Completed);
    assert_eq!(client.calls(), 7);

    // Three calls at a time over seven files: chunks of 3, 3 and 1, each
    // settling before the next begins.
    let kinds = event_kinds(&handle.events().snapshot());
    assert_eq!(
        kinds,
        vec![
            "cache",
            "chunk-start",
            "progress",
            "progress",
            "progress",
            "chunk-complete",
            "chunk-start",
            "progress",
            "progress",
            "progress",
            "chunk-complete",
            "chunk-start",
            "progress",
            "chunk-complete",
            "complete",
        ]
    );

    let starts: Vec<(usize, usize, usize)> = handle
        .events()
        .snapshot()
        .into_iter()
        .filter_map(|stored| match stored.event {
            BatchEvent::ChunkStart {
                chunk_index,
                total_chunks,
                files_in_chunk,
            } => Some((chunk_index, total_chunks, files_in_chunk)),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec![(0, 3, 3), (1, 3, 3), (2, 3, 1)]);

    let completions: Vec<(usize, usize, usize)> = handle
        .events()
        .snapshot()
        .into_iter()
        .filter_map(|stored| match stored.event {
            BatchEvent::ChunkComplete {
                chunk_index,
                success_count,
                failed_count,
            } => Some((chunk_index, success_count, failed_count)),
            _ => None,
        })
        .collect();
    assert_eq!(completions, vec![(0, 3, 0), (1, 3, 0), (2, 1, 0)]);
}

#[tokio::test]
async fn progress_index_counts_settled_files() {
    let client = Arc::new(ScriptedVision::new());
    let h = harness(ProviderKind::Gemini, Arc::clone(&client) as _);
    let files: Vec<_> = (0..4).map(|i| file(&format!("shot-{i}.png"))).collect();
    let handle = h.store.create(files, BatchContext::default());

    h.processor
        .run(Arc::clone(&handle))
        .await
        .expect("batch runs");

    let indexes: Vec<(usize, usize)> = handle
        .events()
        .snapshot()
        .into_iter()
        .filter_map(|stored| match stored.event {
            BatchEvent::Progress { index, total, .. } => Some((index, total)),
            _ => None,
        })
        .collect();
    assert_eq!(indexes, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
}

#[tokio::test]
async fn duplicates_settle_without_provider_calls() {
    let client = Arc::new(ScriptedVision::new());
    let h = harness(ProviderKind::Gemini, Arc::clone(&client) as _);
    let files = vec![file("a.png"), duplicate("b.png"), file("c.png")];
    let handle = h.store.create(files, BatchContext::default());

    h.processor
        .run(Arc::clone(&handle))
        .await
        .expect("batch runs");

    assert_eq!(client.calls(), 2);
    {
        let state = handle.state();
        assert_eq!(state.skipped_duplicates, 1);
        let dup = state
            .results
            .iter()
            .find(|result| result.filename == "b.png")
            .expect("duplicate result");
        assert!(dup.success);
        assert_eq!(dup.item_count, 0);
        assert_eq!(dup.token_cost, 0);
    }
    // Duplicates never touch the ledger again; the prior day's entry stands.
    assert!(h
        .ledger
        .entries()
        .iter()
        .all(|entry| entry.filename != "b.png"));

    let events = handle.events().snapshot();
    assert!(events.iter().any(|stored| matches!(
        &stored.event,
        BatchEvent::Duplicate { filename } if filename == "b.png"
    )));
    let complete = events.last().expect("events present");
    assert!(matches!(
        &complete.event,
        BatchEvent::Complete { skipped_count: 1, failed_count: 0, .. }
    ));
}

#[tokio::test]
async fn transient_failure_recovers_in_retry_phase() {
    let flaky = file("flaky.png");
    let client = Arc::new(ScriptedVision::new().script(
        &flaky,
        vec![
            Err(ExtractError::Transient("502".into())),
            Err(ExtractError::RateLimited("slow down".into())),
            Err(ExtractError::Transient("502".into())),
            Ok(extraction(2, 300)),
        ],
    ));
    let h = harness(ProviderKind::Gemini, Arc::clone(&client) as _);
    let handle = h
        .store
        .create(vec![flaky, file("ok.png")], BatchContext::default());

    h.processor
        .run(Arc::clone(&handle))
        .await
        .expect("batch runs");

    assert_eq!(handle.status(), BatchStatus::Completed);
    // Three parallel-pass attempts, one serial retry, one for the healthy file.
    assert_eq!(client.calls(), 5);
    {
        let state = handle.state();
        assert_eq!(state.results.len(), 2);
        assert!(state.results.iter().all(|result| result.success));
        assert!(state.retry_queue.is_empty());
    }

    let kinds = event_kinds(&handle.events().snapshot());
    let tail: Vec<_> = kinds
        .iter()
        .skip_while(|kind| **kind != "queued-for-retry")
        .copied()
        .collect();
    assert_eq!(
        tail,
        vec![
            "queued-for-retry",
            "chunk-complete",
            "retry-phase",
            "retry",
            "progress",
            "retry-complete",
            "complete",
        ]
    );
    assert!(handle.events().snapshot().iter().any(|stored| matches!(
        stored.event,
        BatchEvent::RetryComplete { recovered_count: 1, permanent_failures: 0 }
    )));
}

#[tokio::test]
async fn exhausted_retries_become_permanent_failures() {
    let broken = file("broken.png");
    let client = Arc::new(ScriptedVision::new().script(
        &broken,
        vec![
            Err(ExtractError::Transient("502".into())),
            Err(ExtractError::Transient("502".into())),
            Err(ExtractError::Transient("502".into())),
            Err(ExtractError::Malformed("not json".into())),
        ],
    ));
    let h = harness(ProviderKind::Gemini, Arc::clone(&client) as _);
    let handle = h
        .store
        .create(vec![broken, file("ok.png")], BatchContext::default());

    h.processor
        .run(Arc::clone(&handle))
        .await
        .expect("batch runs");

    assert_eq!(handle.status(), BatchStatus::Completed);
    {
        let state = handle.state();
        let failed = state
            .results
            .iter()
            .find(|result| result.filename == "broken.png")
            .expect("terminal result");
        assert!(!failed.success);
        assert!(state.errors.contains_key("broken.png"));
    }
    let failed_entry = h
        .ledger
        .entries()
        .into_iter()
        .find(|entry| entry.filename == "broken.png")
        .expect("ledgered failure");
    assert_eq!(failed_entry.status, UploadStatus::Failed);

    let events = handle.events().snapshot();
    assert!(events.iter().any(|stored| matches!(
        stored.event,
        BatchEvent::RetryComplete { recovered_count: 0, permanent_failures: 1 }
    )));
    assert!(matches!(
        &events.last().expect("events present").event,
        BatchEvent::Complete { failed_count: 1, .. }
    ));
}

#[tokio::test]
async fn fatal_provider_error_fails_the_whole_batch() {
    let poisoned = file("poisoned.png");
    let client = Arc::new(
        ScriptedVision::new().script(&poisoned, vec![Err(ExtractError::Fatal("401".into()))]),
    );
    let h = harness(ProviderKind::Gemini, Arc::clone(&client) as _);
    let handle = h.store.create(
        vec![poisoned, file("never-reached.png"), file("also-never.png"), file("fourth.png")],
        BatchContext::default(),
    );

    let outcome = h.processor.run(Arc::clone(&handle)).await;
    assert!(outcome.is_err());
    assert_eq!(handle.status(), BatchStatus::Failed);

    // Nothing past the first chunk ran, and every unsettled file was
    // recorded as abandoned rather than failed.
    let entries = h.ledger.entries();
    let abandoned: Vec<_> = entries
        .iter()
        .filter(|entry| entry.status == UploadStatus::Abandoned)
        .collect();
    assert!(abandoned.iter().any(|entry| entry.filename == "fourth.png"));
    assert!(abandoned.iter().any(|entry| entry.filename == "poisoned.png"));

    let events = handle.events().snapshot();
    let system_errors: Vec<_> = events
        .iter()
        .filter(|stored| {
            matches!(&stored.event, BatchEvent::Error { filename, .. } if filename == "system")
        })
        .collect();
    assert_eq!(system_errors.len(), 1);
    assert!(!event_kinds(&events).contains(&"complete"));
}

#[tokio::test]
async fn abandon_before_start_records_every_file() {
    let client = Arc::new(ScriptedVision::new());
    let h = harness(ProviderKind::Gemini, Arc::clone(&client) as _);
    let handle = h
        .store
        .create(vec![file("a.png"), file("b.png")], BatchContext::default());
    handle.request_abandon();

    h.processor
        .run(Arc::clone(&handle))
        .await
        .expect("abandon is not an orchestration error");

    assert_eq!(handle.status(), BatchStatus::Failed);
    assert_eq!(client.calls(), 0);
    let entries = h.ledger.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|entry| entry.status == UploadStatus::Abandoned));
}

#[tokio::test]
async fn abandon_mid_flight_cancels_outstanding_calls() {
    let store = Arc::new(BatchStore::new());
    let client = Arc::new(AbandoningVision {
        store: Arc::clone(&store),
        batch_id: Mutex::new(String::new()),
    });
    let adapter = Arc::new(ExtractionAdapter::new(
        ProviderKind::Gemini,
        Arc::clone(&client) as _,
        AdapterConfig::builder()
            .base_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .build(),
    ));
    let ledger = Arc::new(MemoryLedger::new());
    let listings = Arc::new(MemoryListingStore::new());
    let processor = BatchProcessor::new(
        adapter,
        Arc::clone(&ledger) as _,
        Arc::clone(&listings) as _,
        ProcessorConfig::builder()
            .stagger_offset(Duration::from_millis(1))
            .retry_cooldown(Duration::from_millis(1))
            .inter_chunk_delay(Duration::from_millis(1))
            .build(),
    );
    let files: Vec<_> = (0..4).map(|i| file(&format!("shot-{i}.png"))).collect();
    let handle = store.create(files, BatchContext::default());
    *client.batch_id.lock().expect("id lock") = handle.id().to_string();

    processor
        .run(Arc::clone(&handle))
        .await
        .expect("abandon is not an orchestration error");

    assert_eq!(handle.status(), BatchStatus::Failed);
    let entries = ledger.entries();
    assert_eq!(entries.len(), 4);
    assert!(entries
        .iter()
        .all(|entry| entry.status == UploadStatus::Abandoned));
    assert!(listings.rows().is_empty());
}

#[tokio::test]
async fn pending_skip_gives_up_on_a_failing_file() {
    let wedged = file("wedged.png");
    let client = Arc::new(ScriptedVision::new().script(
        &wedged,
        vec![
            Err(ExtractError::Transient("502".into())),
            Err(ExtractError::Transient("502".into())),
            Err(ExtractError::Transient("502".into())),
        ],
    ));
    let h = harness(ProviderKind::Gemini, Arc::clone(&client) as _);
    let handle = h.store.create(vec![wedged], BatchContext::default());
    handle.request_skip();

    h.processor
        .run(Arc::clone(&handle))
        .await
        .expect("batch runs");

    assert_eq!(handle.status(), BatchStatus::Completed);
    // The skip was observed between attempts, so fewer than three calls
    // reach the provider after the first failure.
    assert!(client.calls() <= 2, "calls = {}", client.calls());

    {
        let state = handle.state();
        let result = state.results.first().expect("terminal result");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("skipped by operator request"));
        assert!(state.retry_queue.is_empty());
    }
    let entry = h
        .ledger
        .entries()
        .into_iter()
        .find(|entry| entry.filename == "wedged.png")
        .expect("ledgered skip");
    assert_eq!(entry.status, UploadStatus::Skipped);

    let events = handle.events().snapshot();
    assert!(matches!(
        &events.last().expect("events present").event,
        BatchEvent::Complete { failed_count: 1, .. }
    ));
}

#[tokio::test]
async fn empty_batch_completes_immediately() {
    let client = Arc::new(ScriptedVision::new());
    let h = harness(ProviderKind::Gemini, Arc::clone(&client) as _);
    let handle = h.store.create(Vec::new(), BatchContext::default());

    h.processor
        .run(Arc::clone(&handle))
        .await
        .expect("batch runs");

    assert_eq!(handle.status(), BatchStatus::Completed);
    assert_eq!(client.calls(), 0);
    let kinds = event_kinds(&handle.events().snapshot());
    assert_eq!(kinds, vec!["cache", "complete"]);
}

#[tokio::test]
async fn batch_context_flows_into_stores() {
    let client = Arc::new(ScriptedVision::new());
    let h = harness(ProviderKind::Gemini, Arc::clone(&client) as _);
    let context = BatchContext {
        uploader: Some("ashe".to_string()),
        partition: Some("emerald-3".to_string()),
    };
    let handle = h.store.create(vec![file("a.png")], context);

    h.processor
        .run(Arc::clone(&handle))
        .await
        .expect("batch runs");

    let entry = h.ledger.entries().into_iter().next().expect("ledger entry");
    assert_eq!(entry.uploader.as_deref(), Some("ashe"));
    assert_eq!(entry.partition.as_deref(), Some("emerald-3"));
    let row = h.listings.rows().into_iter().next().expect("listing row");
    assert_eq!(row.uploader.as_deref(), Some("ashe"));
    assert_eq!(row.partition.as_deref(), Some("emerald-3"));
    assert_eq!(row.source_file, "a.png");
}
