//! Indexer orchestration.
//!
//! `Indexer` wires the pipeline for one run and owns it until it stops:
//! - `poller` follows the ledger tip and emits heights in order.
//! - `chunk_pool` fetches the chunks of admitted blocks in any order.
//! - `manager` restores height order and dispatches one block at a time.
//! - the receipt handler turns each block into events on the `EventStream`.
//! - `lifecycle` holds the run token, fatal error propagation and metrics.

use super::backoff::{retry_ledger_call, RetryPolicy};
use super::chunk_pool::{ChunkPool, ChunkPoolParams};
use super::lifecycle::{LifecycleHandles, LifecycleSpawnParams};
use super::manager::{Manager, ManagerParams, ShutdownReport};
use super::poller::{BlockPoller, BlockPollerParams};
use crate::ledger::{BlockHeight, LedgerClient, ThrottledLedger};
use crate::receipts::dedup::RecentReceipts;
use crate::receipts::handler::{ReceiptHandler, ReceiptHandlerParams};
use crate::runtime::config::IndexerConfig;
use crate::runtime::policy::{EventDecoder, ReceiptFilter};
use crate::runtime::progress::ProgressTracker;
use crate::runtime::sink::{event_channel, EventStream};
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, bail, Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const JOIN_GRACE: Duration = Duration::from_secs(1);

pub struct Indexer<F, D: EventDecoder> {
    config: IndexerConfig,
    ledger: Arc<dyn LedgerClient>,
    filter: Arc<F>,
    decoder: Arc<D>,
    shutdown_root: CancellationToken,
    progress: Arc<ProgressTracker>,
    telemetry: Arc<Telemetry>,
    recent: Arc<Mutex<RecentReceipts>>,
    lifecycle: Option<LifecycleHandles>,
    manager_handle: Option<JoinHandle<Result<ShutdownReport>>>,
    running: bool,
}

impl<F, D> Indexer<F, D>
where
    F: ReceiptFilter,
    D: EventDecoder,
{
    /// Creates an indexer with its own root cancellation token.
    ///
    /// Use [`Self::with_cancellation_token`] to tie it into an existing
    /// shutdown mechanism.
    pub fn new(config: IndexerConfig, ledger: Arc<dyn LedgerClient>, filter: F, decoder: D) -> Self {
        Self::with_cancellation_token(config, ledger, filter, decoder, CancellationToken::new())
    }

    /// Creates an indexer whose runs derive their cancellation from
    /// `shutdown_token`. Cancelling it stops the pipeline.
    pub fn with_cancellation_token(
        config: IndexerConfig,
        ledger: Arc<dyn LedgerClient>,
        filter: F,
        decoder: D,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            progress: Arc::new(ProgressTracker::new(config.start_after())),
            recent: Arc::new(Mutex::new(RecentReceipts::new(config.dedup_window()))),
            config,
            ledger,
            filter: Arc::new(filter),
            decoder: Arc::new(decoder),
            shutdown_root: shutdown_token,
            telemetry: Arc::new(Telemetry::default()),
            lifecycle: None,
            manager_handle: None,
            running: false,
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Returns the watermark: every height up to it has been fully handled.
    ///
    /// Returns `None` until a starting point is known.
    pub fn last_confirmed_height(&self) -> Option<BlockHeight> {
        self.progress.last_confirmed()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown_root.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Replaces the root shutdown token. Only valid while the indexer is idle.
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            !self.running,
            "shutdown token should not change while the indexer is running"
        );
        self.shutdown_root = shutdown;
    }

    /// Starts the pipeline and returns the stream of indexed events.
    ///
    /// A fresh indexer starts after the configured `start_after` height, or
    /// after the current ledger tip when none is configured. A restarted one
    /// resumes after its last confirmed height.
    pub async fn start(&mut self) -> Result<EventStream<D::Event>> {
        if self.running {
            bail!("indexer already running");
        }
        if self.shutdown_root.is_cancelled() {
            bail!("shutdown token already cancelled; replace it before starting");
        }

        debug_assert!(
            self.config.validate().is_ok(),
            "IndexerConfig should have been validated at construction time"
        );

        let workers = self.config.chunk_workers().max(1);
        let retry = RetryPolicy::from_config(&self.config);
        let ledger: Arc<dyn LedgerClient> = Arc::new(ThrottledLedger::new(
            self.ledger.clone(),
            workers + 1,
            self.config.rpc_timeout(),
            self.telemetry.clone(),
        ));

        let lifecycle = LifecycleHandles::spawn(LifecycleSpawnParams {
            shutdown_root: &self.shutdown_root,
            telemetry: self.telemetry.clone(),
            metrics_interval: self.config.metrics_interval(),
        });
        let fatal_handler = lifecycle.fatal_handler();
        let run_token = lifecycle.run_token.clone();

        let resume = self.progress.last_confirmed().or(self.config.start_after());
        let watermark = match resume {
            Some(height) => height,
            None => match fetch_tip(&ledger, retry, &run_token)
                .await
                .context("failed to fetch initial ledger tip")
            {
                Ok(height) => height,
                Err(err) => {
                    lifecycle.shutdown().await;
                    return Err(err);
                }
            },
        };
        self.progress.reset(Some(watermark));

        tracing::info!(
            start_after = watermark,
            chunk_workers = workers,
            max_in_flight_blocks = self.config.max_in_flight_blocks(),
            "starting indexer"
        );

        let (reports_tx, reports_rx) = mpsc::channel(workers.saturating_mul(2).max(8));
        let (poller_tx, poller_rx) = mpsc::channel(1);
        let (handler_tx, handler_rx) = mpsc::channel(1);
        let (events_tx, events) = event_channel(self.config.event_buffer());

        let pool = ChunkPool::launch(ChunkPoolParams {
            workers,
            ledger: ledger.clone(),
            retry,
            reports: reports_tx.clone(),
            shutdown: run_token.clone(),
            fatal_handler: fatal_handler.clone(),
            telemetry: self.telemetry.clone(),
        });

        let poller = BlockPoller::spawn(BlockPollerParams {
            ledger: ledger.clone(),
            retry,
            polling_interval: self.config.polling_interval(),
            watermark,
            events: poller_tx,
            reports: reports_tx.clone(),
            shutdown: run_token.clone(),
            fatal_handler: fatal_handler.clone(),
        });

        let handler = ReceiptHandler::new(ReceiptHandlerParams {
            ledger,
            filter: self.filter.clone(),
            decoder: self.decoder.clone(),
            retry,
            outcome_concurrency: self.config.outcome_concurrency(),
            recent: self.recent.clone(),
            blocks: handler_rx,
            events: events_tx,
            reports: reports_tx,
            shutdown: run_token.clone(),
            telemetry: self.telemetry.clone(),
        })
        .spawn(fatal_handler.clone());

        let manager = Manager::new(ManagerParams {
            watermark,
            max_in_flight: self.config.max_in_flight_blocks(),
            pool,
            poller: poller_rx,
            reports: reports_rx,
            handler: handler_tx,
            tasks: vec![("block poller", poller), ("receipt handler", handler)],
            progress: self.progress.clone(),
            telemetry: self.telemetry.clone(),
            fatal_handler,
            shutdown: run_token,
            join_timeout: self.config.rpc_timeout() + JOIN_GRACE,
        });

        self.manager_handle = Some(tokio::spawn(manager.run()));
        self.lifecycle = Some(lifecycle);
        self.running = true;

        Ok(events)
    }

    /// Waits until the pipeline stops on its own, after a fatal error or a
    /// cancelled shutdown token.
    pub async fn wait(&mut self) -> Result<ShutdownReport> {
        if !self.running {
            return Ok(self.idle_report());
        }

        let outcome = match self.manager_handle.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => Err(anyhow!(err).context("manager task failed")),
            },
            None => Ok(self.idle_report()),
        };

        if let Some(lifecycle) = self.lifecycle.take() {
            lifecycle.shutdown().await;
        }
        self.running = false;

        match &outcome {
            Ok(report) => tracing::info!(last_confirmed = ?report.last_confirmed, "indexer stopped"),
            Err(err) => {
                let rendered = format!("{err:#}");
                tracing::error!(error = %rendered, "indexer stopped with error");
            }
        }
        outcome
    }

    /// Stops the pipeline and waits for every task to finish.
    ///
    /// Returns the fatal error that halted the run, if there was one.
    pub async fn stop(&mut self) -> Result<ShutdownReport> {
        if !self.running {
            return Ok(self.idle_report());
        }

        tracing::info!("stopping indexer");
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.run_token.cancel();
        }
        self.wait().await
    }

    fn idle_report(&self) -> ShutdownReport {
        ShutdownReport {
            last_confirmed: self.progress.last_confirmed(),
            telemetry: self.telemetry.snapshot(),
        }
    }
}

async fn fetch_tip(
    ledger: &Arc<dyn LedgerClient>,
    retry: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<BlockHeight> {
    let header = retry_ledger_call(
        retry.backoff(cancel),
        |_| ledger.get_latest_block(),
        |attempt, backoff, err, will_retry| {
            if will_retry {
                tracing::warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "initial tip fetch failed; retrying"
                );
            }
        },
    )
    .await
    .map_err(|failure| {
        failure
            .into_error()
            .unwrap_or_else(|| anyhow!("cancelled while fetching the ledger tip"))
    })?;
    Ok(header.height)
}
