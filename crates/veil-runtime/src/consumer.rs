use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use veil_core::types::FeedEvent;
use veil_observe::metrics::{Counter, Gauge};
use veil_store::{ChangeFeed, CheckpointStore, SourceStore, TargetStore};

use crate::buffer::{BatchBuffer, Drained};
use crate::writer::SinkWriter;

#[derive(Debug, Clone, Copy)]
pub struct FeedCaps {
    /// Size trigger: flush as soon as this many records are buffered.
    pub batch_max_records: usize,
    /// Time trigger: flush on this period regardless of volume.
    pub flush_interval: Duration,
}

impl Default for FeedCaps {
    fn default() -> Self {
        Self {
            batch_max_records: 1000,
            flush_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Default)]
pub struct FeedMetrics {
    pub flushed_batches_total: Counter,
    pub flushed_records_total: Counter,
    pub skipped_events_total: Counter,
    pub checkpoint_writes_total: Counter,
    pub buffered_records: Gauge,
}

/// Continuous change-feed replication: subscribe at the last checkpoint,
/// buffer full documents, flush on size or period, persist the feed
/// position only after the batch is durably written.
///
/// Failure contract: a broken subscription is fatal and propagates out of
/// `run` (the last persisted checkpoint stays valid for a fresh process);
/// a failed bulk write is absorbed by putting the batch back in the buffer
/// so a later flush replays it, and the checkpoint does not advance past
/// it; an event without its full document is skipped and counted.
pub struct FeedConsumer<S, T, C>
where
    S: SourceStore,
    T: TargetStore,
    C: CheckpointStore,
{
    source: Arc<S>,
    writer: SinkWriter<T>,
    checkpoints: Arc<C>,
    caps: FeedCaps,
    metrics: Arc<FeedMetrics>,
    buffer: Arc<BatchBuffer>,
    // Serializes the drain -> save -> persist sequence across the two
    // triggers so checkpoints commit in drain order.
    flush_gate: Arc<tokio::sync::Mutex<()>>,
}

impl<S, T, C> Clone for FeedConsumer<S, T, C>
where
    S: SourceStore,
    T: TargetStore,
    C: CheckpointStore,
{
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            writer: self.writer.clone(),
            checkpoints: self.checkpoints.clone(),
            caps: self.caps,
            metrics: self.metrics.clone(),
            buffer: self.buffer.clone(),
            flush_gate: self.flush_gate.clone(),
        }
    }
}

impl<S, T, C> FeedConsumer<S, T, C>
where
    S: SourceStore,
    T: TargetStore,
    C: CheckpointStore,
{
    pub fn new(source: Arc<S>, writer: SinkWriter<T>, checkpoints: Arc<C>, caps: FeedCaps) -> Self {
        Self {
            source,
            writer,
            checkpoints,
            caps,
            metrics: Arc::new(FeedMetrics::default()),
            buffer: Arc::new(BatchBuffer::new()),
            flush_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn metrics(&self) -> Arc<FeedMetrics> {
        self.metrics.clone()
    }

    /// Runs until the feed ends, the shutdown signal fires, or the
    /// subscription fails. On a graceful stop the buffer is flushed one
    /// last time before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let checkpoints = self.checkpoints.clone();
        let resume = tokio::task::spawn_blocking(move || checkpoints.load())
            .await
            .map_err(anyhow::Error::from)??;

        tracing::info!(
            target: "veil_flow",
            event = "subscribing",
            resuming = resume.is_some(),
            "opening change feed"
        );
        let mut feed = self.source.subscribe(resume.as_ref())?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let timer = tokio::spawn(self.clone().run_timer(cancel_rx));

        let streamed = self.stream_events(&mut feed, &mut shutdown).await;
        let _ = cancel_tx.send(true);
        timer.await.map_err(anyhow::Error::from)??;

        match streamed {
            Ok(()) => {
                // Graceful stop: hand off whatever is still buffered.
                self.flush_all("final").await?;
                tracing::info!(target: "veil_flow", event = "stopped", "feed consumer stopped");
                Ok(())
            }
            Err(err) => {
                // The in-memory pending checkpoint dies with the buffer;
                // the last persisted one stays valid for a fresh process.
                tracing::error!(
                    target: "veil_flow",
                    event = "subscription_failed",
                    error = %err,
                    "change feed failed"
                );
                Err(err)
            }
        }
    }

    async fn stream_events(
        &self,
        feed: &mut ChangeFeed,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow_and_update() {
                        return Ok(());
                    }
                }
                received = feed.recv() => {
                    match received {
                        None => return Ok(()),
                        Some(Err(err)) => {
                            return Err(anyhow::Error::new(err)
                                .context("change feed subscription failed"));
                        }
                        Some(Ok(event)) => self.on_event(event).await?,
                    }
                }
            }
        }
    }

    async fn on_event(&self, event: FeedEvent) -> Result<()> {
        let Some(document) = event.full_document else {
            // The row vanished before the feed could attach the document.
            // Deletions are unsupported, so this event carries nothing to
            // replicate.
            self.metrics.skipped_events_total.inc();
            tracing::warn!(
                target: "veil_flow",
                event = "event_skipped",
                operation = ?event.operation,
                "change event without full document"
            );
            return Ok(());
        };

        let len = self.buffer.append(document, event.token);
        self.metrics.buffered_records.set(len as u64);

        if len >= self.caps.batch_max_records {
            self.flush_if_full().await?;
        }
        Ok(())
    }

    async fn flush_if_full(&self) -> Result<()> {
        let _gate = self.flush_gate.lock().await;
        let Some(drained) = self.buffer.drain_if_at_least(self.caps.batch_max_records) else {
            // The timer got here first; nothing left to do.
            return Ok(());
        };
        self.commit(drained, "size").await
    }

    async fn flush_all(&self, trigger: &'static str) -> Result<()> {
        let _gate = self.flush_gate.lock().await;
        let drained = self.buffer.drain_all();
        self.commit(drained, trigger).await
    }

    /// Write the drained batch, then (and only then) persist its token.
    /// Errors returned here are task-join failures; store-level write
    /// failures are absorbed by restoring the batch.
    async fn commit(&self, drained: Drained, trigger: &'static str) -> Result<()> {
        self.metrics.buffered_records.set(self.buffer.len() as u64);
        if drained.is_empty() {
            return Ok(());
        }

        let record_count = drained.records.len();
        match self.writer.save(&drained.records).await {
            Ok(committed) => {
                self.metrics.flushed_batches_total.inc();
                self.metrics.flushed_records_total.inc_by(committed as u64);
                tracing::info!(
                    target: "veil_flow",
                    event = "flush_committed",
                    trigger = trigger,
                    record_count = committed as u64,
                    "flushed batch"
                );

                if let Some(token) = drained.token {
                    let checkpoints = self.checkpoints.clone();
                    let persisted =
                        tokio::task::spawn_blocking(move || checkpoints.save(&token))
                            .await
                            .map_err(anyhow::Error::from)?;
                    match persisted {
                        Ok(()) => self.metrics.checkpoint_writes_total.inc(),
                        Err(err) => {
                            // The batch is committed, so the worst case on
                            // restart is a re-delivered batch hitting
                            // idempotent upserts.
                            tracing::error!(
                                target: "veil_flow",
                                event = "checkpoint_write_failed",
                                error = %err,
                                "failed to persist feed position"
                            );
                        }
                    }
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    target: "veil_flow",
                    event = "flush_failed",
                    trigger = trigger,
                    record_count = record_count as u64,
                    error = %err,
                    "bulk write failed; batch queued for replay"
                );
                self.buffer.restore(drained);
                self.metrics.buffered_records.set(self.buffer.len() as u64);
                Ok(())
            }
        }
    }

    async fn run_timer(self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let start = tokio::time::Instant::now() + self.caps.flush_interval;
        let mut interval = tokio::time::interval_at(start, self.caps.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.flush_all("timer").await?;
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow_and_update() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
