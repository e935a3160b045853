//! Block poller: follows the ledger tip and emits every new height once, in
//! increasing order.

use super::backoff::{retry_ledger_call, RetryPolicy};
use super::lifecycle::spawn_supervised;
use super::messages::{PollerEvent, ReportSender, WorkerReport};
use crate::ledger::{BlockHeight, LedgerClient, LedgerError};
use crate::runtime::error::{IndexerError, PipelineStage};
use crate::runtime::fatal::FatalErrorHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub(crate) struct BlockPoller {
    ledger: Arc<dyn LedgerClient>,
    retry: RetryPolicy,
    polling_interval: Duration,
    last_emitted: BlockHeight,
    events: mpsc::Sender<PollerEvent>,
    reports: ReportSender,
    shutdown: CancellationToken,
}

pub(crate) struct BlockPollerParams {
    pub ledger: Arc<dyn LedgerClient>,
    pub retry: RetryPolicy,
    pub polling_interval: Duration,
    pub watermark: BlockHeight,
    pub events: mpsc::Sender<PollerEvent>,
    pub reports: ReportSender,
    pub shutdown: CancellationToken,
    pub fatal_handler: Arc<FatalErrorHandler>,
}

enum Step {
    Continue,
    Stop,
}

impl BlockPoller {
    pub(crate) fn spawn(params: BlockPollerParams) -> JoinHandle<()> {
        let poller = Self {
            ledger: params.ledger,
            retry: params.retry,
            polling_interval: params.polling_interval,
            last_emitted: params.watermark,
            events: params.events,
            reports: params.reports,
            shutdown: params.shutdown,
        };
        spawn_supervised("block poller".to_string(), params.fatal_handler, poller.run())
    }

    #[tracing::instrument(name = "block_poller", skip_all, fields(start_after = self.last_emitted))]
    async fn run(mut self) {
        let mut ticker = interval(self.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Step::Stop = self.poll_once().await {
                break;
            }
        }

        tracing::info!(last_emitted = self.last_emitted, "block poller stopped");
    }

    async fn poll_once(&mut self) -> Step {
        let latest = match retry_ledger_call(
            self.retry.backoff(&self.shutdown),
            |_| self.ledger.get_latest_block(),
            |attempt, backoff, err, will_retry| {
                log_retry("latest block", None, attempt, backoff, err, will_retry)
            },
        )
        .await
        {
            Ok(header) => header.height,
            Err(failure) => {
                if let Some(err) = failure.into_error() {
                    self.fail(IndexerError::new(PipelineStage::Poll, "latest block", err))
                        .await;
                }
                return Step::Stop;
            }
        };

        if latest <= self.last_emitted {
            tracing::trace!(latest, last_emitted = self.last_emitted, "no new blocks");
            return Step::Continue;
        }

        tracing::debug!(
            latest,
            last_emitted = self.last_emitted,
            "ledger advanced; emitting new heights"
        );

        for height in self.last_emitted.saturating_add(1)..=latest {
            let event = match self.fetch_height(height, latest).await {
                Ok(event) => event,
                Err(None) => return Step::Stop,
                Err(Some(err)) => {
                    self.fail(IndexerError::new(
                        PipelineStage::Poll,
                        format!("block {height}"),
                        err,
                    ))
                    .await;
                    return Step::Stop;
                }
            };

            // Suspends here while the manager is saturated.
            let sent = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => false,
                sent = self.events.send(event) => sent.is_ok(),
            };
            if !sent {
                return Step::Stop;
            }
            self.last_emitted = height;
        }

        Step::Continue
    }

    /// `Err(None)` means cancelled.
    async fn fetch_height(
        &self,
        height: BlockHeight,
        latest: BlockHeight,
    ) -> Result<PollerEvent, Option<anyhow::Error>> {
        retry_ledger_call(
            self.retry.backoff(&self.shutdown),
            |_| async move {
                match self.ledger.get_block(height).await? {
                    Some(block) if block.height() == height => Ok(PollerEvent::Block(block)),
                    Some(block) => Err(LedgerError::fatal(
                        "block",
                        format!(
                            "requested height {height} but ledger returned height {}",
                            block.height()
                        ),
                    )),
                    None if height < latest => Ok(PollerEvent::Skipped(height)),
                    None => Err(LedgerError::not_found(
                        "block",
                        format!("latest height {height} reported but block not available"),
                    )),
                }
            },
            |attempt, backoff, err, will_retry| {
                log_retry("block", Some(height), attempt, backoff, err, will_retry)
            },
        )
        .await
        .map_err(|failure| failure.into_error())
    }

    async fn fail(&self, error: IndexerError) {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {}
            _ = self.reports.send(WorkerReport::Failed(error)) => {}
        }
    }
}

fn log_retry(
    what: &'static str,
    height: Option<BlockHeight>,
    attempt: usize,
    backoff: Duration,
    err: &LedgerError,
    will_retry: bool,
) {
    if will_retry {
        tracing::warn!(
            what,
            height,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "ledger call failed; retrying"
        );
    } else {
        tracing::error!(
            what,
            height,
            attempt,
            error = %err,
            "ledger call failed; retries exhausted"
        );
    }
}
