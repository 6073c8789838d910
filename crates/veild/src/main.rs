#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

mod synth;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tracing::info;

use veil_anonymize::GeneratorKind;
use veil_runtime::backfill::{BackfillCaps, BackfillRunner};
use veil_runtime::consumer::{FeedCaps, FeedConsumer};
use veil_runtime::writer::SinkWriter;
use veil_store::fs::FsCheckpointStore;
use veil_store::memory::{MemorySourceStore, MemoryTargetStore};

#[derive(Debug, Parser)]
#[command(name = "veild")]
struct Args {
    /// Run a full backfill instead of consuming the change feed, then exit.
    #[arg(long, env = "VEIL_BACKFILL", default_value_t = false)]
    backfill: bool,

    /// In feed mode, catch up on records newer than the target's newest
    /// before subscribing.
    #[arg(long, env = "VEIL_CATCH_UP", default_value_t = false)]
    catch_up: bool,

    /// Store connection string. Only the in-process `mem://` backend is
    /// built in; real database backends are external collaborators.
    #[arg(long, env = "VEIL_STORE_URL", default_value = "mem://demo")]
    store_url: String,

    #[arg(long, env = "VEIL_CHECKPOINT_PATH", default_value = ".veil/checkpoint")]
    checkpoint_path: PathBuf,

    #[arg(long, env = "VEIL_BATCH_SIZE", default_value_t = 1000)]
    batch_size: usize,

    #[arg(long, env = "VEIL_FLUSH_INTERVAL_MS", default_value_t = 1000)]
    flush_interval_ms: u64,

    #[arg(long, env = "VEIL_BACKFILL_PAGE_SIZE", default_value_t = 100_000)]
    backfill_page_size: usize,

    /// Anonymization strategy: deterministic|random.
    #[arg(long, env = "VEIL_GENERATOR", default_value = "deterministic")]
    generator: GeneratorKind,

    #[arg(long, env = "VEIL_GENERATOR_KEY", default_value = "veil-dev-key")]
    generator_key: String,

    /// Synthetic records to feed into the mem:// source store (demo load;
    /// 0 disables).
    #[arg(long, env = "VEIL_SYNTHETIC_RECORDS", default_value_t = 0)]
    synthetic_records: u64,

    #[arg(long, env = "VEIL_SYNTHETIC_INTERVAL_MS", default_value_t = 10)]
    synthetic_interval_ms: u64,
}

struct Stores {
    source: Arc<MemorySourceStore>,
    target: Arc<MemoryTargetStore>,
}

fn connect(store_url: &str) -> Result<Stores> {
    let Some(name) = store_url.strip_prefix("mem://") else {
        anyhow::bail!(
            "cannot connect to {store_url:?}: only mem:// stores are built in"
        );
    };
    info!(store = name, "using in-process source/target store");
    Ok(Stores {
        source: Arc::new(MemorySourceStore::new()),
        target: Arc::new(MemoryTargetStore::new()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    veil_observe::logging::init_tracing();
    let args = Args::parse();

    let stores = connect(&args.store_url)?;
    let writer = SinkWriter::new(
        stores.target.clone(),
        args.generator.build(&args.generator_key),
    );
    let backfill_caps = BackfillCaps {
        page_size: args.backfill_page_size,
    };

    if args.backfill {
        // Full backfill is a one-shot maintenance run; seed the demo store
        // up front, transform everything, exit.
        if args.synthetic_records > 0 {
            seed_synthetic(&stores.source, args.synthetic_records);
        }
        let runner = BackfillRunner::new(
            stores.source.clone(),
            stores.target.clone(),
            writer,
            backfill_caps,
        );
        let total = runner.run_full().await?;
        info!(record_count = total, "full backfill complete");
        return Ok(());
    }

    if args.catch_up {
        let runner = BackfillRunner::new(
            stores.source.clone(),
            stores.target.clone(),
            writer.clone(),
            backfill_caps,
        );
        let total = runner.run_incremental().await?;
        info!(record_count = total, "incremental catch-up complete");
    }

    let checkpoints = Arc::new(FsCheckpointStore::new(&args.checkpoint_path));
    let caps = FeedCaps {
        batch_max_records: args.batch_size.max(1),
        flush_interval: Duration::from_millis(args.flush_interval_ms.max(1)),
    };
    let consumer = FeedConsumer::new(stores.source.clone(), writer, checkpoints, caps);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    if args.synthetic_records > 0 {
        let source = stores.source.clone();
        let count = args.synthetic_records;
        let every = Duration::from_millis(args.synthetic_interval_ms.max(1));
        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            for seq in 0..count {
                source.insert(synth::synthetic_record(&mut rng, seq));
                tokio::time::sleep(every).await;
            }
            info!(record_count = count, "synthetic load complete");
        });
    }

    consumer.run(shutdown_rx).await
}

fn seed_synthetic(source: &MemorySourceStore, count: u64) {
    let mut rng = StdRng::from_entropy();
    for seq in 0..count {
        source.insert(synth::synthetic_record(&mut rng, seq));
    }
    info!(record_count = count, "seeded synthetic source records");
}
