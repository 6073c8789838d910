use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `VEIL_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for the replicator:
/// - Include `record_count` on every flush/commit event.
/// - Include `trigger` ("size" or "timer") on flush events.
/// - Include the feed `operation` on skip events (a skipped event has no
///   document, so there is no record id to log).
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("VEIL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
