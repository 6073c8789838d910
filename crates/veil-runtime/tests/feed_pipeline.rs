use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use veil_anonymize::DeterministicGenerator;
use veil_core::types::{FeedOperation, PostalAddress, RecordId, SourceRecord};
use veil_runtime::consumer::{FeedCaps, FeedConsumer};
use veil_runtime::writer::SinkWriter;
use veil_store::memory::{MemoryCheckpointStore, MemorySourceStore, MemoryTargetStore};
use veil_store::CheckpointStore;

fn record(id: &str, created_at_unix_ms: u64) -> SourceRecord {
    SourceRecord {
        id: RecordId(id.to_string()),
        given_name: format!("Given-{id}"),
        family_name: format!("Family-{id}"),
        email: format!("{id}@x.com"),
        address: PostalAddress {
            line1: "1 Station Road".to_string(),
            line2: "Unit 2".to_string(),
            postcode: "AB1 2CD".to_string(),
            city: "City".to_string(),
            region: "Region".to_string(),
            country: "GB".to_string(),
        },
        created_at_unix_ms,
    }
}

struct Harness {
    source: Arc<MemorySourceStore>,
    target: Arc<MemoryTargetStore>,
    checkpoints: Arc<MemoryCheckpointStore>,
    caps: FeedCaps,
}

impl Harness {
    fn new(caps: FeedCaps) -> Self {
        Self {
            source: Arc::new(MemorySourceStore::new()),
            target: Arc::new(MemoryTargetStore::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            caps,
        }
    }

    fn consumer(&self) -> FeedConsumer<MemorySourceStore, MemoryTargetStore, MemoryCheckpointStore> {
        let writer = SinkWriter::new(
            self.target.clone(),
            Box::new(DeterministicGenerator::new(b"test-key".to_vec())),
        );
        FeedConsumer::new(
            self.source.clone(),
            writer,
            self.checkpoints.clone(),
            self.caps,
        )
    }

    async fn wait_for_subscriber(&self) {
        let source = self.source.clone();
        assert!(
            wait_for(Duration::from_secs(5), move || source.subscriber_count() > 0).await,
            "consumer never subscribed"
        );
    }
}

async fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn size_trigger_flushes_full_batch_and_checkpoints() {
    let harness = Harness::new(FeedCaps {
        batch_max_records: 5,
        flush_interval: Duration::from_secs(60),
    });
    let consumer = harness.consumer();
    let metrics = consumer.metrics();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(shutdown_rx).await }
    });

    harness.wait_for_subscriber().await;
    for i in 0..5u64 {
        harness.source.insert(record(&format!("r{i}"), i + 1));
    }

    let m = metrics.clone();
    assert!(
        wait_for(Duration::from_secs(5), move || m.checkpoint_writes_total.get() == 1).await,
        "size-triggered flush never landed"
    );
    assert_eq!(harness.target.document_count(), 5);
    assert_eq!(metrics.flushed_batches_total.get(), 1);
    assert_eq!(metrics.flushed_records_total.get(), 5);
    assert!(harness.checkpoints.load().unwrap().is_some());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_flushes_partial_batch() {
    let harness = Harness::new(FeedCaps {
        batch_max_records: 1000,
        flush_interval: Duration::from_millis(50),
    });
    let consumer = harness.consumer();
    let metrics = consumer.metrics();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(shutdown_rx).await }
    });

    harness.wait_for_subscriber().await;
    harness.source.insert(record("a", 1));
    harness.source.insert(record("b", 2));
    harness.source.insert(record("c", 3));

    let m = metrics.clone();
    assert!(
        wait_for(Duration::from_secs(5), move || m.flushed_records_total.get() == 3).await,
        "timer flush never landed"
    );
    assert_eq!(harness.target.document_count(), 3);
    assert!(harness.checkpoints.load().unwrap().is_some());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replicated_documents_are_anonymized() {
    let harness = Harness::new(FeedCaps {
        batch_max_records: 1,
        flush_interval: Duration::from_secs(60),
    });
    let consumer = harness.consumer();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(shutdown_rx).await }
    });

    harness.wait_for_subscriber().await;
    harness.source.insert(record("a", 7));

    let target = harness.target.clone();
    assert!(wait_for(Duration::from_secs(5), move || target.document_count() == 1).await);

    let doc = harness.target.get(&RecordId("a".to_string())).unwrap();
    assert_eq!(doc.id, RecordId("a".to_string()));
    assert_eq!(doc.created_at_unix_ms, 7);
    assert_ne!(doc.given_name, "Given-a");
    assert_ne!(doc.family_name, "Family-a");
    assert!(doc.email.ends_with("@x.com"));
    assert!(!doc.email.starts_with("a@"));
    assert_eq!(doc.address.city, "City");
    assert_eq!(doc.address.region, "Region");
    assert_eq!(doc.address.country, "GB");

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_without_documents_are_skipped() {
    let harness = Harness::new(FeedCaps {
        batch_max_records: 2,
        flush_interval: Duration::from_millis(50),
    });
    let consumer = harness.consumer();
    let metrics = consumer.metrics();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(shutdown_rx).await }
    });

    harness.wait_for_subscriber().await;
    harness
        .source
        .publish_without_document(FeedOperation::Update);
    harness.source.insert(record("a", 1));
    harness.source.insert(record("b", 2));

    let m = metrics.clone();
    assert!(wait_for(Duration::from_secs(5), move || m.flushed_records_total.get() == 2).await);
    assert_eq!(harness.target.document_count(), 2);
    assert_eq!(metrics.skipped_events_total.get(), 1);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_bulk_write_is_replayed_without_advancing_checkpoint() {
    let harness = Harness::new(FeedCaps {
        batch_max_records: 2,
        flush_interval: Duration::from_millis(50),
    });
    let consumer = harness.consumer();
    let metrics = consumer.metrics();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(shutdown_rx).await }
    });

    harness.wait_for_subscriber().await;
    harness.target.inject_failure_once();
    harness.source.insert(record("a", 1));
    harness.source.insert(record("b", 2));

    // The size-triggered flush fails, the batch goes back in the buffer,
    // and a later timer flush replays it.
    let m = metrics.clone();
    assert!(
        wait_for(Duration::from_secs(5), move || m.checkpoint_writes_total.get() == 1).await,
        "failed batch was never replayed"
    );
    assert_eq!(harness.target.document_count(), 2);
    assert_eq!(metrics.flushed_batches_total.get(), 1);
    assert!(harness.checkpoints.load().unwrap().is_some());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkpoint_advances_monotonically_across_flushes() {
    let harness = Harness::new(FeedCaps {
        batch_max_records: 1,
        flush_interval: Duration::from_secs(60),
    });
    let consumer = harness.consumer();
    let metrics = consumer.metrics();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(shutdown_rx).await }
    });

    harness.wait_for_subscriber().await;
    harness.source.insert(record("a", 1));
    let m = metrics.clone();
    assert!(wait_for(Duration::from_secs(5), move || m.checkpoint_writes_total.get() == 1).await);
    let first = harness.checkpoints.load().unwrap().unwrap();

    harness.source.insert(record("b", 2));
    let m = metrics.clone();
    assert!(wait_for(Duration::from_secs(5), move || m.checkpoint_writes_total.get() == 2).await);
    let second = harness.checkpoints.load().unwrap().unwrap();

    // The memory store encodes positions big-endian, so byte order is
    // feed order.
    assert!(second.0 > first.0, "checkpoint went backwards");

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_and_restart_redelivers_only_the_unflushed_batch() {
    let harness = Harness::new(FeedCaps {
        batch_max_records: 2,
        flush_interval: Duration::from_secs(60),
    });
    let consumer = harness.consumer();
    let metrics = consumer.metrics();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(shutdown_rx).await }
    });

    harness.wait_for_subscriber().await;
    harness.source.insert(record("a", 1));
    harness.source.insert(record("b", 2));

    let m = metrics.clone();
    assert!(wait_for(Duration::from_secs(5), move || m.checkpoint_writes_total.get() == 1).await);
    assert_eq!(harness.target.document_count(), 2);
    let committed_checkpoint = harness.checkpoints.load().unwrap().unwrap();

    // One more event sits in the buffer, unflushed, when the feed dies.
    harness.source.insert(record("c", 3));
    let m = metrics.clone();
    assert!(wait_for(Duration::from_secs(5), move || m.buffered_records.get() == 1).await);

    harness.source.fail_subscriptions("connection reset");
    let crashed = task.await.unwrap();
    assert!(crashed.is_err(), "subscription failure must be fatal");

    // The pending token died with the process; the persisted one did not.
    assert_eq!(
        harness.checkpoints.load().unwrap().unwrap(),
        committed_checkpoint
    );
    assert_eq!(harness.target.document_count(), 2);

    // A fresh consumer resumes from the persisted checkpoint and sees only
    // the unflushed event again.
    let restarted = harness.consumer();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let restarted = restarted.clone();
        async move { restarted.run(shutdown_rx).await }
    });
    harness.wait_for_subscriber().await;

    // One live event on top of the replayed one fills the batch.
    harness.source.insert(record("d", 4));

    let target = harness.target.clone();
    assert!(
        wait_for(Duration::from_secs(5), move || target.document_count() == 4).await,
        "restart never replayed the unflushed batch"
    );
    assert!(harness.target.get(&RecordId("c".to_string())).is_some());
    assert!(harness.target.get(&RecordId("d".to_string())).is_some());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feed_end_stops_the_consumer_cleanly() {
    let harness = Harness::new(FeedCaps {
        batch_max_records: 1000,
        flush_interval: Duration::from_secs(60),
    });
    let consumer = harness.consumer();
    let metrics = consumer.metrics();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(shutdown_rx).await }
    });

    harness.wait_for_subscriber().await;
    harness.source.insert(record("a", 1));
    let m = metrics.clone();
    assert!(wait_for(Duration::from_secs(5), move || m.buffered_records.get() == 1).await);

    harness.source.close_subscriptions();
    task.await.unwrap().unwrap();

    // The final flush hands off what was still buffered.
    assert_eq!(harness.target.document_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_shutdown_flushes_the_remaining_buffer() {
    let harness = Harness::new(FeedCaps {
        batch_max_records: 1000,
        flush_interval: Duration::from_secs(60),
    });
    let consumer = harness.consumer();
    let metrics = consumer.metrics();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(shutdown_rx).await }
    });

    harness.wait_for_subscriber().await;
    harness.source.insert(record("a", 1));
    harness.source.insert(record("b", 2));
    let m = metrics.clone();
    assert!(wait_for(Duration::from_secs(5), move || m.buffered_records.get() == 2).await);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(harness.target.document_count(), 2);
    assert!(harness.checkpoints.load().unwrap().is_some());
}
