use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    blocks_admitted: AtomicU64,
    blocks_completed: AtomicU64,
    skipped_heights: AtomicU64,
    chunks_fetched: AtomicU64,
    chunk_retries: AtomicU64,
    outcomes_fetched: AtomicU64,
    events_emitted: AtomicU64,
    duplicate_receipts: AtomicU64,
    ledger_calls: AtomicU64,
    ledger_errors: AtomicU64,
    ledger_timeouts: AtomicU64,
    peak_in_flight_blocks: AtomicU64,
}

impl Telemetry {
    pub fn record_block_admitted(&self, in_flight: usize) {
        self.blocks_admitted.fetch_add(1, Ordering::Relaxed);
        self.peak_in_flight_blocks
            .fetch_max(in_flight as u64, Ordering::Relaxed);
    }

    pub fn record_block_completed(&self) {
        self.blocks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_height(&self) {
        self.skipped_heights.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_fetched(&self) {
        self.chunks_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_retry(&self) {
        self.chunk_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome_fetched(&self) {
        self.outcomes_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_emitted(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_receipt(&self) {
        self.duplicate_receipts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ledger_call(&self) {
        self.ledger_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ledger_error(&self) {
        self.ledger_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ledger_timeout(&self) {
        self.ledger_timeouts.fetch_add(1, Ordering::Relaxed);
        self.ledger_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            blocks_admitted: self.blocks_admitted.load(Ordering::Relaxed),
            blocks_completed: self.blocks_completed.load(Ordering::Relaxed),
            skipped_heights: self.skipped_heights.load(Ordering::Relaxed),
            chunks_fetched: self.chunks_fetched.load(Ordering::Relaxed),
            chunk_retries: self.chunk_retries.load(Ordering::Relaxed),
            outcomes_fetched: self.outcomes_fetched.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            duplicate_receipts: self.duplicate_receipts.load(Ordering::Relaxed),
            ledger_calls: self.ledger_calls.load(Ordering::Relaxed),
            ledger_errors: self.ledger_errors.load(Ordering::Relaxed),
            ledger_timeouts: self.ledger_timeouts.load(Ordering::Relaxed),
            peak_in_flight_blocks: self.peak_in_flight_blocks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub blocks_admitted: u64,
    pub blocks_completed: u64,
    pub skipped_heights: u64,
    pub chunks_fetched: u64,
    pub chunk_retries: u64,
    pub outcomes_fetched: u64,
    pub events_emitted: u64,
    pub duplicate_receipts: u64,
    pub ledger_calls: u64,
    pub ledger_errors: u64,
    pub ledger_timeouts: u64,
    pub peak_in_flight_blocks: u64,
}

/// Spawns a background task that periodically logs block throughput, event
/// counts and ledger errors.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "shardwatch::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let completed_delta = current
                        .blocks_completed
                        .saturating_sub(last_snapshot.blocks_completed);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        completed_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "shardwatch::metrics",
                        throughput = format!("{throughput:.2}"),
                        completed = current.blocks_completed,
                        in_flight = current.blocks_admitted.saturating_sub(current.blocks_completed),
                        skipped = current.skipped_heights,
                        chunks = current.chunks_fetched,
                        chunk_retries = current.chunk_retries,
                        outcomes = current.outcomes_fetched,
                        events = current.events_emitted,
                        duplicates = current.duplicate_receipts,
                        ledger_errors = current.ledger_errors,
                        ledger_timeouts = current.ledger_timeouts,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
