//! Receipt handler: turns the chunks of one ready block at a time into
//! indexed events.

use super::dedup::RecentReceipts;
use crate::ledger::{
    BlockHeight, BlockId, LedgerClient, Outcome, OutcomeRequest, Receipt, ReceiptId,
};
use crate::processor::backoff::{retry_ledger_call, RetryPolicy};
use crate::processor::lifecycle::spawn_supervised;
use crate::processor::messages::{ReadyBlock, ReportSender, WorkerReport};
use crate::runtime::error::{IndexerError, PipelineStage};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::policy::{EventDecoder, ReceiptFilter};
use crate::runtime::sink::IndexedEvent;
use crate::runtime::telemetry::Telemetry;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// `Err(None)` means the work was cancelled.
type HandlerResult<T> = Result<T, Option<IndexerError>>;

pub(crate) struct ReceiptHandler<F, D: EventDecoder> {
    ledger: Arc<dyn LedgerClient>,
    filter: Arc<F>,
    decoder: Arc<D>,
    retry: RetryPolicy,
    outcome_concurrency: usize,
    recent: Arc<Mutex<RecentReceipts>>,
    blocks: mpsc::Receiver<ReadyBlock>,
    events: mpsc::Sender<IndexedEvent<D::Event>>,
    reports: ReportSender,
    shutdown: CancellationToken,
    telemetry: Arc<Telemetry>,
}

pub(crate) struct ReceiptHandlerParams<F, D: EventDecoder> {
    pub ledger: Arc<dyn LedgerClient>,
    pub filter: Arc<F>,
    pub decoder: Arc<D>,
    pub retry: RetryPolicy,
    pub outcome_concurrency: usize,
    /// Shared with the owning indexer so it outlives a single run.
    pub recent: Arc<Mutex<RecentReceipts>>,
    pub blocks: mpsc::Receiver<ReadyBlock>,
    pub events: mpsc::Sender<IndexedEvent<D::Event>>,
    pub reports: ReportSender,
    pub shutdown: CancellationToken,
    pub telemetry: Arc<Telemetry>,
}

impl<F, D> ReceiptHandler<F, D>
where
    F: ReceiptFilter,
    D: EventDecoder,
{
    pub(crate) fn new(params: ReceiptHandlerParams<F, D>) -> Self {
        Self {
            ledger: params.ledger,
            filter: params.filter,
            decoder: params.decoder,
            retry: params.retry,
            outcome_concurrency: params.outcome_concurrency.max(1),
            recent: params.recent,
            blocks: params.blocks,
            events: params.events,
            reports: params.reports,
            shutdown: params.shutdown,
            telemetry: params.telemetry,
        }
    }

    pub(crate) fn spawn(self, fatal_handler: Arc<FatalErrorHandler>) -> JoinHandle<()> {
        spawn_supervised("receipt handler".to_string(), fatal_handler, self.run())
    }

    #[tracing::instrument(name = "receipt_handler", skip_all)]
    async fn run(mut self) {
        loop {
            let block = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                block = self.blocks.recv() => block,
            };
            let Some(block) = block else {
                break;
            };

            let height = block.header.height;
            let report = match self.handle_block(block).await {
                Ok(()) => WorkerReport::BlockHandled(height),
                Err(None) => break,
                Err(Some(err)) => WorkerReport::Failed(err),
            };

            let failed = matches!(report, WorkerReport::Failed(_));
            let delivered = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => false,
                sent = self.reports.send(report) => sent.is_ok(),
            };
            if failed || !delivered {
                break;
            }
        }

        tracing::debug!("receipt handler stopped");
    }

    pub(crate) async fn handle_block(&mut self, block: ReadyBlock) -> HandlerResult<()> {
        let ReadyBlock { header, chunks } = block;
        let height = header.height;

        let mut seen_in_block = HashSet::new();
        let mut relevant = Vec::new();
        for receipt in chunks.into_iter().flat_map(|chunk| chunk.receipts) {
            let is_relevant = self.filter.is_relevant(&receipt).map_err(|err| {
                Some(IndexerError::new(
                    PipelineStage::Filter,
                    receipt_target(height, &receipt),
                    err,
                ))
            })?;
            if !is_relevant {
                continue;
            }
            if self.already_emitted(&receipt.id) || !seen_in_block.insert(receipt.id.clone()) {
                self.telemetry.record_duplicate_receipt();
                tracing::debug!(height, receipt = %receipt.id, "skipping already handled receipt");
                continue;
            }
            relevant.push(receipt);
        }

        if relevant.is_empty() {
            tracing::trace!(height, "no relevant receipts in block");
            return Ok(());
        }

        let ledger = &self.ledger;
        let shutdown = &self.shutdown;
        let telemetry = &self.telemetry;
        let retry = self.retry;
        let block_id = &header.id;

        // Lookups overlap; `buffered` keeps receipt order.
        let mut resolved = futures::stream::iter(relevant.into_iter().map(|receipt| async move {
            let outcome = resolve_outcome(
                ledger.as_ref(),
                retry,
                shutdown,
                telemetry,
                &receipt,
                block_id,
                height,
            )
            .await;
            (receipt, outcome)
        }))
        .buffered(self.outcome_concurrency);

        while let Some((receipt, outcome)) = resolved.next().await {
            let outcome = outcome?;
            let decoded = self.decoder.decode(&receipt, &outcome).map_err(|err| {
                Some(IndexerError::new(
                    PipelineStage::Decode,
                    receipt_target(height, &receipt),
                    err,
                ))
            })?;

            if let Some(event) = decoded {
                let indexed = IndexedEvent {
                    height,
                    receipt_id: receipt.id.clone(),
                    event,
                };
                let sent = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Err(None),
                    sent = self.events.send(indexed) => sent,
                };
                if sent.is_err() {
                    return Err(Some(IndexerError::new(
                        PipelineStage::Dispatch,
                        receipt_target(height, &receipt),
                        anyhow::anyhow!("event stream was dropped by the consumer"),
                    )));
                }
                telemetry.record_event_emitted();
            }

            self.remember(receipt.id);
        }

        Ok(())
    }

    fn already_emitted(&self, id: &ReceiptId) -> bool {
        self.recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(id)
    }

    fn remember(&self, id: ReceiptId) {
        self.recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id);
    }
}

async fn resolve_outcome(
    ledger: &dyn LedgerClient,
    retry: RetryPolicy,
    shutdown: &CancellationToken,
    telemetry: &Telemetry,
    receipt: &Receipt,
    block_id: &BlockId,
    height: BlockHeight,
) -> HandlerResult<Outcome> {
    if let Some(outcome) = &receipt.outcome {
        return Ok(outcome.clone());
    }

    let request = OutcomeRequest::for_receipt(receipt, block_id);
    let outcome = retry_ledger_call(
        retry.backoff(shutdown),
        |_| ledger.get_receipt_outcome(&request),
        |attempt, backoff, err, will_retry| {
            if will_retry {
                tracing::warn!(
                    height,
                    receipt = %receipt.id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "outcome lookup failed; retrying"
                );
            }
        },
    )
    .await
    .map_err(|failure| {
        failure.into_error().map(|err| {
            IndexerError::new(
                PipelineStage::OutcomeFetch,
                receipt_target(height, receipt),
                err,
            )
        })
    })?;

    telemetry.record_outcome_fetched();
    Ok(outcome)
}

fn receipt_target(height: BlockHeight, receipt: &Receipt) -> String {
    format!("block {height} receipt {}", receipt.id)
}
