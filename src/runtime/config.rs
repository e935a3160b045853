use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_POLLING_INTERVAL_MS: u64 = 1_200;
const DEFAULT_CHUNK_WORKERS: usize = 4;
const DEFAULT_MAX_IN_FLIGHT_BLOCKS: usize = 16;
const DEFAULT_MAX_ATTEMPTS: usize = 20;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 250;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 10;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DEDUP_WINDOW: usize = 100_000;
const DEFAULT_OUTCOME_CONCURRENCY: usize = 4;
const DEFAULT_EVENT_BUFFER: usize = 1_024;

/// Runtime configuration for the indexing pipeline.
///
/// All instances must be constructed via [`IndexerConfig::builder`] or [`IndexerConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerConfig {
    rpc_url: String,
    api_key: Option<String>,
    polling_interval: Duration,
    chunk_workers: usize,
    max_in_flight_blocks: usize,
    max_attempts: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    rpc_timeout: Duration,
    metrics_interval: Duration,
    start_after: Option<u64>,
    dedup_window: usize,
    outcome_concurrency: usize,
    event_buffer: usize,
}

pub struct IndexerConfigParams {
    pub rpc_url: String,
    pub api_key: Option<String>,
    pub polling_interval: Duration,
    pub chunk_workers: usize,
    pub max_in_flight_blocks: usize,
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub rpc_timeout: Duration,
    pub metrics_interval: Duration,
    pub start_after: Option<u64>,
    pub dedup_window: usize,
    pub outcome_concurrency: usize,
    pub event_buffer: usize,
}

impl IndexerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> IndexerConfigBuilder {
        IndexerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`IndexerConfig::builder`] when most values use defaults.
    pub fn new(params: IndexerConfigParams) -> Result<Self> {
        let IndexerConfigParams {
            rpc_url,
            api_key,
            polling_interval,
            chunk_workers,
            max_in_flight_blocks,
            max_attempts,
            initial_backoff,
            max_backoff,
            rpc_timeout,
            metrics_interval,
            start_after,
            dedup_window,
            outcome_concurrency,
            event_buffer,
        } = params;

        let config = Self {
            rpc_url: rpc_url.trim().to_owned(),
            api_key: api_key
                .map(|key| key.trim().to_owned())
                .filter(|key| !key.is_empty()),
            polling_interval,
            chunk_workers,
            max_in_flight_blocks,
            max_attempts,
            initial_backoff,
            max_backoff,
            rpc_timeout,
            metrics_interval,
            start_after,
            dedup_window,
            outcome_concurrency,
            event_buffer,
        };

        config.validate()?;
        Ok(config)
    }

    /// Full RPC URL (including scheme) of the ledger endpoint.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Optional API key sent with every RPC request.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Interval between two checks of the ledger tip.
    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// Number of concurrent chunk fetch workers.
    pub fn chunk_workers(&self) -> usize {
        self.chunk_workers
    }

    /// Maximum number of admitted blocks not yet handled.
    pub fn max_in_flight_blocks(&self) -> usize {
        self.max_in_flight_blocks
    }

    /// Attempts made for a single remote call before it escalates to fatal.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Hard timeout applied to every remote call.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Last height already processed by a previous run, if any.
    pub fn start_after(&self) -> Option<u64> {
        self.start_after
    }

    /// Number of recently delivered receipt ids remembered for de-duplication.
    pub fn dedup_window(&self) -> usize {
        self.dedup_window
    }

    /// Concurrent outcome lookups within a single block.
    pub fn outcome_concurrency(&self) -> usize {
        self.outcome_concurrency
    }

    /// Capacity of the channel feeding the caller's event stream.
    pub fn event_buffer(&self) -> usize {
        self.event_buffer
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.rpc_url)?;

        if self.polling_interval.is_zero() {
            bail!("polling_interval must be greater than 0");
        }

        if self.chunk_workers == 0 {
            bail!("chunk_workers must be greater than 0");
        }

        if self.max_in_flight_blocks == 0 {
            bail!("max_in_flight_blocks must be greater than 0");
        }

        if self.max_attempts == 0 {
            bail!("max_attempts must be greater than 0");
        }

        if self.initial_backoff.is_zero() {
            bail!("initial_backoff must be greater than 0");
        }

        if self.max_backoff < self.initial_backoff {
            bail!(
                "max_backoff ({:?}) must be at least initial_backoff ({:?})",
                self.max_backoff,
                self.initial_backoff
            );
        }

        if self.rpc_timeout.is_zero() {
            bail!("rpc_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.dedup_window == 0 {
            bail!("dedup_window must be greater than 0");
        }

        if self.outcome_concurrency == 0 {
            bail!("outcome_concurrency must be greater than 0");
        }

        if self.event_buffer == 0 {
            bail!("event_buffer must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct IndexerConfigBuilder {
    rpc_url: Option<String>,
    api_key: Option<String>,
    polling_interval: Option<Duration>,
    chunk_workers: Option<usize>,
    max_in_flight_blocks: Option<usize>,
    max_attempts: Option<usize>,
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    rpc_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
    start_after: Option<u64>,
    dedup_window: Option<usize>,
    outcome_concurrency: Option<usize>,
    event_buffer: Option<usize>,
}

impl IndexerConfigBuilder {
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    pub fn chunk_workers(mut self, count: usize) -> Self {
        self.chunk_workers = Some(count);
        self
    }

    pub fn max_in_flight_blocks(mut self, count: usize) -> Self {
        self.max_in_flight_blocks = Some(count);
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn start_after(mut self, height: u64) -> Self {
        self.start_after = Some(height);
        self
    }

    pub fn dedup_window(mut self, receipts: usize) -> Self {
        self.dedup_window = Some(receipts);
        self
    }

    pub fn outcome_concurrency(mut self, limit: usize) -> Self {
        self.outcome_concurrency = Some(limit);
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = Some(capacity);
        self
    }

    pub fn build(self) -> Result<IndexerConfig> {
        let params = IndexerConfigParams {
            rpc_url: self.rpc_url.context("rpc_url is required")?,
            api_key: self.api_key,
            polling_interval: self
                .polling_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_POLLING_INTERVAL_MS)),
            chunk_workers: self.chunk_workers.unwrap_or(DEFAULT_CHUNK_WORKERS),
            max_in_flight_blocks: self
                .max_in_flight_blocks
                .unwrap_or(DEFAULT_MAX_IN_FLIGHT_BLOCKS),
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_backoff: self
                .initial_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS)),
            max_backoff: self
                .max_backoff
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS)),
            rpc_timeout: self
                .rpc_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            start_after: self.start_after,
            dedup_window: self.dedup_window.unwrap_or(DEFAULT_DEDUP_WINDOW),
            outcome_concurrency: self
                .outcome_concurrency
                .unwrap_or(DEFAULT_OUTCOME_CONCURRENCY),
            event_buffer: self.event_buffer.unwrap_or(DEFAULT_EVENT_BUFFER),
        };

        IndexerConfig::new(params)
    }
}

fn validate_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("rpc_url must start with http:// or https://");
    }
    Ok(())
}
