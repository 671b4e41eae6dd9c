//! Per-batch progress channel: an ordered, replayable log of typed events
//! plus a broadcast fan-out for live subscribers. The replay contract is
//! subscribe-from-index: a reconnecting client hands over the last index it
//! saw and receives everything strictly after it, each index at most once.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the orchestrator reports about one batch, in the order it
/// happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BatchEvent {
    Progress {
        filename: String,
        item_count: usize,
        token_usage: u64,
        index: usize,
        total: usize,
    },
    Duplicate {
        filename: String,
    },
    ChunkStart {
        chunk_index: usize,
        total_chunks: usize,
        files_in_chunk: usize,
    },
    ChunkComplete {
        chunk_index: usize,
        success_count: usize,
        failed_count: usize,
    },
    QueuedForRetry {
        filename: String,
        error: String,
    },
    RetryPhase {
        failed_count: usize,
    },
    Retry {
        filename: String,
    },
    RetryComplete {
        recovered_count: usize,
        permanent_failures: usize,
    },
    Cache {
        status: String,
    },
    /// `filename == "system"` signals a fatal, batch-ending orchestration
    /// error as opposed to a per-file error.
    Error {
        filename: String,
        message: String,
    },
    Complete {
        total_items: usize,
        total_tokens: u64,
        skipped_count: usize,
        failed_count: usize,
    },
}

pub const SYSTEM_SCOPE: &str = "system";

/// An event together with its position in the batch's log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub index: u64,
    pub event: BatchEvent,
}

/// One broadcast channel per batch. The log is append-only; indexes are
/// assigned contiguously from zero under the log lock, so subscribers can
/// rely on them for dedup.
pub struct EventChannel {
    log: Mutex<Vec<StoredEvent>>,
    tx: broadcast::Sender<StoredEvent>,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            log: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// Append and fan out, returning the assigned index. Live delivery is
    /// best-effort; the log is the source of truth for replay.
    pub fn publish(&self, event: BatchEvent) -> u64 {
        let mut log = self.log.lock().expect("event log lock poisoned");
        let index = log.len() as u64;
        let stored = StoredEvent { index, event };
        log.push(stored.clone());
        let _ = self.tx.send(stored);
        index
    }

    /// Settled events strictly after `last_index` (all of them when `None`)
    /// plus a live receiver. The receiver is registered before the log
    /// snapshot is taken, so events landing in between appear in both; the
    /// transport drops live events whose index was already replayed.
    pub fn subscribe_from(
        &self,
        last_index: Option<u64>,
    ) -> (Vec<StoredEvent>, broadcast::Receiver<StoredEvent>) {
        let rx = self.tx.subscribe();
        let log = self.log.lock().expect("event log lock poisoned");
        let replay = log
            .iter()
            .filter(|stored| last_index.is_none_or(|seen| stored.index > seen))
            .cloned()
            .collect();
        (replay, rx)
    }

    pub fn len(&self) -> usize {
        self.log.lock().expect("event log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full copy of the settled log, oldest first.
    pub fn snapshot(&self) -> Vec<StoredEvent> {
        self.log.lock().expect("event log lock poisoned").clone()
    }
}
