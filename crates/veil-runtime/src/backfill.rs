use std::sync::Arc;

use anyhow::Result;

use veil_core::types::SourceRecord;
use veil_store::{RecordCursor, SourceStore, StoreError, TargetStore};

use crate::writer::SinkWriter;

#[derive(Debug, Clone, Copy)]
pub struct BackfillCaps {
    /// Records accumulated per bulk save while paging the cursor.
    pub page_size: usize,
}

impl Default for BackfillCaps {
    fn default() -> Self {
        Self { page_size: 100_000 }
    }
}

/// One-shot bulk re-transform of the source collection, bypassing the feed.
///
/// Never runs concurrently with the feed consumer in one process. A failed
/// page save aborts the run without advancing the cursor; re-running the
/// backfill is safe because every write is an idempotent upsert.
pub struct BackfillRunner<S, T>
where
    S: SourceStore,
    T: TargetStore,
{
    source: Arc<S>,
    target: Arc<T>,
    writer: SinkWriter<T>,
    caps: BackfillCaps,
}

impl<S, T> BackfillRunner<S, T>
where
    S: SourceStore,
    T: TargetStore,
{
    pub fn new(source: Arc<S>, target: Arc<T>, writer: SinkWriter<T>, caps: BackfillCaps) -> Self {
        Self {
            source,
            target,
            writer,
            caps,
        }
    }

    /// Re-transforms the entire source collection. Returns the committed
    /// record count.
    pub async fn run_full(&self) -> Result<u64> {
        tracing::info!(target: "veil_flow", event = "backfill_started", mode = "full", "starting backfill");
        self.run_scan(None).await
    }

    /// Re-transforms only records not older than the newest record already
    /// present in the target store. The boundary record is deliberately
    /// reprocessed (inclusive bound); with an empty target this does
    /// nothing.
    pub async fn run_incremental(&self) -> Result<u64> {
        let target = self.target.clone();
        let bound = tokio::task::spawn_blocking(move || target.latest_created_unix_ms())
            .await
            .map_err(anyhow::Error::from)??;

        let Some(min_created_unix_ms) = bound else {
            tracing::info!(
                target: "veil_flow",
                event = "backfill_skipped",
                mode = "incremental",
                "target store is empty; nothing to catch up"
            );
            return Ok(0);
        };

        tracing::info!(
            target: "veil_flow",
            event = "backfill_started",
            mode = "incremental",
            min_created_unix_ms = min_created_unix_ms,
            "starting backfill"
        );
        self.run_scan(Some(min_created_unix_ms)).await
    }

    async fn run_scan(&self, min_created_unix_ms: Option<u64>) -> Result<u64> {
        let source = self.source.clone();
        let mut cursor = tokio::task::spawn_blocking(move || source.scan(min_created_unix_ms))
            .await
            .map_err(anyhow::Error::from)??;

        let mut total: u64 = 0;
        let mut pages: u64 = 0;
        loop {
            let page_size = self.caps.page_size;
            let (returned, page) = tokio::task::spawn_blocking(
                move || -> Result<(Box<dyn RecordCursor>, Vec<SourceRecord>), StoreError> {
                    let mut cursor = cursor;
                    let page = cursor.next_page(page_size)?;
                    Ok((cursor, page))
                },
            )
            .await
            .map_err(anyhow::Error::from)??;
            cursor = returned;

            if page.is_empty() {
                break;
            }

            let committed = self.writer.save(&page).await?;
            total = total.saturating_add(committed as u64);
            pages = pages.saturating_add(1);
            tracing::info!(
                target: "veil_flow",
                event = "backfill_page_committed",
                page = pages,
                record_count = committed as u64,
                "committed backfill page"
            );
        }

        tracing::info!(
            target: "veil_flow",
            event = "backfill_finished",
            pages = pages,
            record_count = total,
            "backfill complete"
        );
        Ok(total)
    }
}
