//! Orchestration layer for IO-bound batch services.
//!
//! Modules exposed here coordinate external systems (vision providers,
//! upload ledger, listing storage) and the concurrency around them. Pure
//! transforms stay out; hashing is the one exception because it is part of
//! the intake contract.

pub mod batch;
pub mod dedup;
pub mod events;
pub mod processor;
pub mod provider;
pub mod storage;

pub use batch::{
    BatchContext, BatchHandle, BatchResult, BatchState, BatchStatus, BatchStore, BatchStoreError,
    FailedFile, FileToProcess,
};
pub use dedup::{DedupFilter, IntakeError, content_hash, intake_file, intake_files};
pub use events::{BatchEvent, EventChannel, SYSTEM_SCOPE, StoredEvent};
pub use processor::{BatchProcessor, ProcessorConfig, ProcessorError};
pub use provider::{
    AdapterConfig, CacheStatus, ExtractError, Extraction, ExtractionAdapter, GeminiVisionClient,
    ListingRecord, ProviderKind, ProviderProfile, TokenUsage, VisionClient,
};
pub use storage::{
    LedgerEntry, ListingInsert, ListingStore, MemoryLedger, MemoryListingStore, StorageError,
    UploadLedger, UploadStatus,
};
