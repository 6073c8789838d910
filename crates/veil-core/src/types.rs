use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity assigned by the source store. Never generated by this system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

/// Opaque change-feed position handed back by the source store.
///
/// Round-tripped through the checkpoint store byte-for-byte; nothing outside
/// the source store may parse or construct one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionToken(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostalAddress {
    pub line1: String,
    pub line2: String,
    pub postcode: String,
    pub city: String,
    pub region: String,
    /// ISO-ish country code, treated as non-identifying.
    pub country: String,
}

/// One person record as stored by the source collection.
///
/// The anonymized projection has the same shape and the same `id`, so the
/// same struct serves both sides of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: RecordId,
    pub given_name: String,
    pub family_name: String,
    pub email: String,
    pub address: PostalAddress,
    /// Replication watermark. Assigned monotonically by the source store and
    /// never mutated after insertion.
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record id must be non-empty")]
    EmptyId,
}

impl SourceRecord {
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.id.0.trim().is_empty() {
            return Err(RecordError::EmptyId);
        }
        Ok(())
    }
}

/// Operation types consumed from the change feed. Deletions are unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedOperation {
    Insert,
    Update,
}

/// One change-feed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub operation: FeedOperation,
    /// Full document as of the event, when the source store could look it
    /// up. Absent when the underlying row disappeared before the lookup;
    /// such events are skipped by the consumer.
    pub full_document: Option<SourceRecord>,
    pub token: PositionToken,
}
