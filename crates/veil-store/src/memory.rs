use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use veil_core::types::{FeedEvent, FeedOperation, PositionToken, RecordId, SourceRecord};

use crate::{ChangeFeed, CheckpointStore, RecordCursor, SourceStore, StoreError, TargetStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process source store: a record map plus an append-only event log.
///
/// Position tokens are the 1-based log sequence number in big-endian bytes.
/// That encoding is private to this store; everything downstream treats the
/// token as opaque.
#[derive(Debug, Default)]
pub struct MemorySourceStore {
    inner: Mutex<SourceInner>,
}

#[derive(Debug, Default)]
struct SourceInner {
    records: BTreeMap<RecordId, SourceRecord>,
    log: Vec<FeedEvent>,
    subscribers: Vec<mpsc::UnboundedSender<Result<FeedEvent, StoreError>>>,
}

fn encode_seq(seq: u64) -> PositionToken {
    PositionToken(seq.to_be_bytes().to_vec())
}

fn decode_seq(token: &PositionToken) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = token
        .0
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::Connection("unintelligible resume token".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: SourceRecord) {
        let mut inner = lock(&self.inner);
        inner.records.insert(record.id.clone(), record.clone());
        Self::append_event(&mut inner, FeedOperation::Insert, Some(record));
    }

    pub fn update(&self, record: SourceRecord) {
        let mut inner = lock(&self.inner);
        inner.records.insert(record.id.clone(), record.clone());
        Self::append_event(&mut inner, FeedOperation::Update, Some(record));
    }

    /// Emits an event whose full document could not be looked up (the row
    /// vanished between the oplog entry and the lookup). Used for load and
    /// failure injection.
    pub fn publish_without_document(&self, operation: FeedOperation) {
        let mut inner = lock(&self.inner);
        Self::append_event(&mut inner, operation, None);
    }

    /// Fails every open subscription, as a broken feed connection would.
    pub fn fail_subscriptions(&self, message: &str) {
        let mut inner = lock(&self.inner);
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(Err(StoreError::Connection(message.to_string())));
        }
    }

    /// Closes every open subscription without an error (feed end).
    pub fn close_subscriptions(&self) {
        let mut inner = lock(&self.inner);
        inner.subscribers.clear();
    }

    pub fn record_count(&self) -> usize {
        lock(&self.inner).records.len()
    }

    /// Open subscriptions. Lets a test wait for a consumer to attach before
    /// publishing, since a tail subscription only sees later events.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    fn append_event(
        inner: &mut SourceInner,
        operation: FeedOperation,
        full_document: Option<SourceRecord>,
    ) {
        let seq = inner.log.len() as u64 + 1;
        let event = FeedEvent {
            operation,
            full_document,
            token: encode_seq(seq),
        };
        inner.log.push(event.clone());
        inner
            .subscribers
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }
}

impl SourceStore for MemorySourceStore {
    fn subscribe(&self, resume: Option<&PositionToken>) -> Result<ChangeFeed, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);

        // Replay and registration happen under one lock so no event can
        // slip between the replayed tail and the live stream.
        if let Some(token) = resume {
            let after = decode_seq(token)?;
            for event in inner.log.iter().skip(after as usize) {
                let _ = tx.send(Ok(event.clone()));
            }
        }
        inner.subscribers.push(tx);

        Ok(ChangeFeed::new(rx))
    }

    fn scan(
        &self,
        min_created_unix_ms: Option<u64>,
    ) -> Result<Box<dyn RecordCursor>, StoreError> {
        let inner = lock(&self.inner);
        let mut records: Vec<SourceRecord> = inner
            .records
            .values()
            .filter(|r| match min_created_unix_ms {
                Some(bound) => r.created_at_unix_ms >= bound,
                None => true,
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at_unix_ms
                .cmp(&b.created_at_unix_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(Box::new(VecCursor { records, next: 0 }))
    }
}

struct VecCursor {
    records: Vec<SourceRecord>,
    next: usize,
}

impl RecordCursor for VecCursor {
    fn next_page(&mut self, max: usize) -> Result<Vec<SourceRecord>, StoreError> {
        let end = (self.next + max.max(1)).min(self.records.len());
        let page = self.records[self.next..end].to_vec();
        self.next = end;
        Ok(page)
    }
}

/// In-process target store with a one-shot injectable bulk failure.
#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    documents: Mutex<BTreeMap<RecordId, SourceRecord>>,
    fail_next: AtomicBool,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `bulk_upsert` fail as a whole, applying nothing.
    pub fn inject_failure_once(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn get(&self, id: &RecordId) -> Option<SourceRecord> {
        lock(&self.documents).get(id).cloned()
    }

    pub fn document_count(&self) -> usize {
        lock(&self.documents).len()
    }

    pub fn snapshot(&self) -> Vec<SourceRecord> {
        lock(&self.documents).values().cloned().collect()
    }
}

impl TargetStore for MemoryTargetStore {
    fn bulk_upsert(&self, records: &[SourceRecord]) -> Result<usize, StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::WriteFailed(
                "injected bulk failure".to_string(),
            ));
        }
        let mut documents = lock(&self.documents);
        for record in records {
            documents.insert(record.id.clone(), record.clone());
        }
        Ok(records.len())
    }

    fn latest_created_unix_ms(&self) -> Result<Option<u64>, StoreError> {
        let documents = lock(&self.documents);
        Ok(documents.values().map(|r| r.created_at_unix_ms).max())
    }
}

/// Volatile checkpoint slot for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    slot: Mutex<Option<PositionToken>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Option<PositionToken>, StoreError> {
        Ok(lock(&self.slot).clone())
    }

    fn save(&self, token: &PositionToken) -> Result<(), StoreError> {
        *lock(&self.slot) = Some(token.clone());
        Ok(())
    }
}
