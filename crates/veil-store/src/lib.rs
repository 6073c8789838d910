#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Collaborator interfaces for the replicator.
//!
//! The source store, target store, and checkpoint store are external
//! systems; this crate pins down the slice of their surface the pipeline
//! depends on and ships an in-process backend (`memory`) plus a durable
//! single-slot checkpoint backend (`fs`). The traits are intentionally
//! synchronous; the runtime calls them through `spawn_blocking` so a slow
//! store exerts backpressure without stalling the tokio runtime.

pub mod fs;
pub mod memory;

use thiserror::Error;
use tokio::sync::mpsc;

use veil_core::types::{FeedEvent, PositionToken, SourceRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("bulk write failed: {0}")]
    WriteFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Live change-feed subscription.
///
/// Events arrive in feed order. An `Err` item is a subscription failure and
/// terminates the feed; the receiver yields `None` once the source store
/// drops its end.
pub struct ChangeFeed {
    events: mpsc::UnboundedReceiver<Result<FeedEvent, StoreError>>,
}

impl ChangeFeed {
    pub fn new(events: mpsc::UnboundedReceiver<Result<FeedEvent, StoreError>>) -> Self {
        Self { events }
    }

    pub async fn recv(&mut self) -> Option<Result<FeedEvent, StoreError>> {
        self.events.recv().await
    }
}

/// Page-wise cursor over source records, ascending by creation time.
///
/// An empty page means the cursor is exhausted.
pub trait RecordCursor: Send {
    fn next_page(&mut self, max: usize) -> Result<Vec<SourceRecord>, StoreError>;
}

/// Read side: change-feed subscription plus bulk scans for backfill.
pub trait SourceStore: Send + Sync + 'static {
    /// Opens a change-feed subscription carrying insert/update events with
    /// the full current document. Resumes after `resume` when present, else
    /// starts at the feed's current tail.
    fn subscribe(&self, resume: Option<&PositionToken>) -> Result<ChangeFeed, StoreError>;

    /// Cursor over the collection, optionally bounded to records with
    /// `created_at_unix_ms >= min_created_unix_ms` (inclusive).
    fn scan(
        &self,
        min_created_unix_ms: Option<u64>,
    ) -> Result<Box<dyn RecordCursor>, StoreError>;
}

/// Write side: idempotent bulk upserts keyed on record id.
pub trait TargetStore: Send + Sync + 'static {
    /// Upserts every record in one call: insert if the id is absent, replace
    /// all fields if present. Returns the committed count. Partial
    /// application on failure is tolerated because each upsert is
    /// individually idempotent.
    fn bulk_upsert(&self, records: &[SourceRecord]) -> Result<usize, StoreError>;

    /// Creation timestamp of the newest record in the target collection
    /// (sort descending, limit 1), used as the incremental-backfill bound.
    fn latest_created_unix_ms(&self) -> Result<Option<u64>, StoreError>;
}

/// Durable single-slot holder for the last acknowledged feed position.
pub trait CheckpointStore: Send + Sync + 'static {
    fn load(&self) -> Result<Option<PositionToken>, StoreError>;

    /// Overwrites the slot. Must not return before the token is durable;
    /// the caller commits batches before calling this.
    fn save(&self, token: &PositionToken) -> Result<(), StoreError>;
}
