use std::sync::Arc;

use anyhow::Result;

use veil_anonymize::{anonymize, Generator};
use veil_core::types::SourceRecord;
use veil_store::TargetStore;

/// Converts a batch of source records into one idempotent bulk upsert.
///
/// Every record is re-anonymized on every save; convergence to one target
/// document per id comes from the upsert key, so re-submitting a batch any
/// number of times is safe. The bulk write runs on a blocking thread so a
/// slow target store exerts backpressure without stalling the runtime.
pub struct SinkWriter<T: TargetStore> {
    target: Arc<T>,
    generator: Arc<dyn Generator>,
}

impl<T: TargetStore> Clone for SinkWriter<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            generator: self.generator.clone(),
        }
    }
}

impl<T: TargetStore> SinkWriter<T> {
    pub fn new(target: Arc<T>, generator: Box<dyn Generator>) -> Self {
        Self {
            target,
            generator: Arc::from(generator),
        }
    }

    /// Anonymizes `records` and submits them as a single bulk upsert.
    /// Returns the committed count; 0 for an empty input without touching
    /// the store. On failure the caller must not advance its checkpoint or
    /// cursor past this batch.
    pub async fn save(&self, records: &[SourceRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let anonymized: Vec<SourceRecord> = records
            .iter()
            .map(|r| anonymize(self.generator.as_ref(), r))
            .collect();

        let target = self.target.clone();
        let committed = tokio::task::spawn_blocking(move || target.bulk_upsert(&anonymized))
            .await
            .map_err(anyhow::Error::from)??;

        tracing::debug!(
            target: "veil_flow",
            event = "batch_committed",
            record_count = committed as u64,
            "committed batch"
        );

        Ok(committed)
    }
}
