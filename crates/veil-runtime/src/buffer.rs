use std::sync::{Mutex, MutexGuard, PoisonError};

use veil_core::types::{PositionToken, SourceRecord};

/// Records drained in one atomic swap, paired with the newest feed position
/// among them.
#[derive(Debug)]
pub struct Drained {
    pub records: Vec<SourceRecord>,
    pub token: Option<PositionToken>,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Shared buffer between the feed callback and the periodic flush timer.
///
/// One mutex guards both the pending records and the pending checkpoint
/// token. Capturing them in the same swap is what keeps a drain from ever
/// pairing a batch with a token belonging to events still in the buffer.
/// No two drains can observe overlapping contents.
#[derive(Debug, Default)]
pub struct BatchBuffer {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<SourceRecord>,
    token: Option<PositionToken>,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends one record and remembers its feed position as the newest
    /// pending checkpoint. Returns the new buffer length.
    pub fn append(&self, record: SourceRecord, token: PositionToken) -> usize {
        let mut inner = self.lock();
        inner.records.push(record);
        inner.token = Some(token);
        inner.records.len()
    }

    /// Swaps out the contents when at least `n` records are pending, else
    /// leaves the buffer untouched.
    pub fn drain_if_at_least(&self, n: usize) -> Option<Drained> {
        let mut inner = self.lock();
        if inner.records.len() < n {
            return None;
        }
        Some(Self::swap(&mut inner))
    }

    /// Unconditionally swaps out the contents. An empty drain is a safe
    /// no-op downstream.
    pub fn drain_all(&self) -> Drained {
        let mut inner = self.lock();
        Self::swap(&mut inner)
    }

    /// Puts a failed batch back in front of whatever arrived since the
    /// drain, so the next flush replays it in order. The newer of the two
    /// pending tokens wins.
    pub fn restore(&self, drained: Drained) {
        let mut inner = self.lock();
        let mut records = drained.records;
        records.append(&mut inner.records);
        inner.records = records;
        if inner.token.is_none() {
            inner.token = drained.token;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn swap(inner: &mut Inner) -> Drained {
        Drained {
            records: std::mem::take(&mut inner.records),
            token: inner.token.take(),
        }
    }
}
