//! Chunk worker pool.
//!
//! `N` workers pull [`ChunkRequest`]s from one shared queue, each holding at
//! most one request at a time, and report fetched chunks to the manager in
//! completion order.

use super::backoff::{retry_ledger_call, RetryPolicy};
use super::lifecycle::spawn_supervised;
use super::messages::{ChunkRequest, ReportSender, WorkerReport};
use crate::ledger::{Chunk, LedgerClient, LedgerError};
use crate::runtime::error::{IndexerError, PipelineStage};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::Telemetry;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type SharedRequests = Arc<Mutex<mpsc::UnboundedReceiver<ChunkRequest>>>;

pub(crate) struct ChunkPool {
    requests: Option<mpsc::UnboundedSender<ChunkRequest>>,
    workers: Vec<JoinHandle<()>>,
}

pub(crate) struct ChunkPoolParams {
    pub workers: usize,
    pub ledger: Arc<dyn LedgerClient>,
    pub retry: RetryPolicy,
    pub reports: ReportSender,
    pub shutdown: CancellationToken,
    pub fatal_handler: Arc<FatalErrorHandler>,
    pub telemetry: Arc<Telemetry>,
}

impl ChunkPool {
    pub(crate) fn launch(params: ChunkPoolParams) -> Self {
        let ChunkPoolParams {
            workers,
            ledger,
            retry,
            reports,
            shutdown,
            fatal_handler,
            telemetry,
        } = params;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let shared: SharedRequests = Arc::new(Mutex::new(requests_rx));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let worker = ChunkWorker {
                    id: worker_id,
                    ledger: ledger.clone(),
                    retry,
                    requests: shared.clone(),
                    reports: reports.clone(),
                    shutdown: shutdown.clone(),
                    telemetry: telemetry.clone(),
                };
                spawn_supervised(
                    format!("chunk worker {worker_id}"),
                    fatal_handler.clone(),
                    worker.run(),
                )
            })
            .collect();

        Self {
            requests: Some(requests_tx),
            workers: handles,
        }
    }

    /// Queues a chunk fetch. Returns `false` once the pool has shut down.
    pub(crate) fn submit(&self, request: ChunkRequest) -> bool {
        self.requests
            .as_ref()
            .map(|tx| tx.send(request).is_ok())
            .unwrap_or(false)
    }

    /// Closes the request queue and hands back the worker handles for joining.
    pub(crate) fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        self.requests.take();
        std::mem::take(&mut self.workers)
    }
}

struct ChunkWorker {
    id: usize,
    ledger: Arc<dyn LedgerClient>,
    retry: RetryPolicy,
    requests: SharedRequests,
    reports: ReportSender,
    shutdown: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl ChunkWorker {
    #[tracing::instrument(name = "chunk_worker", skip_all, fields(worker = self.id))]
    async fn run(self) {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                request = next_request(&self.requests) => request,
            };
            let Some(request) = request else {
                break;
            };

            let report = match self.fetch(&request).await {
                Ok(chunk) => WorkerReport::ChunkFetched {
                    height: request.height,
                    index: request.index,
                    chunk,
                },
                Err(None) => break,
                Err(Some(err)) => WorkerReport::Failed(IndexerError::new(
                    PipelineStage::ChunkFetch,
                    format!(
                        "block {} shard {} chunk {}",
                        request.height, request.reference.shard_id, request.reference.chunk_id
                    ),
                    err,
                )),
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

        tracing::debug!("chunk worker stopped");
    }

    /// `Err(None)` means cancelled.
    async fn fetch(&self, request: &ChunkRequest) -> Result<Chunk, Option<anyhow::Error>> {
        let reference = &request.reference;
        let chunk = retry_ledger_call(
            self.retry.backoff(&self.shutdown),
            |_| async move {
                let chunk = self.ledger.get_chunk(reference).await?;
                if chunk.chunk_id != reference.chunk_id {
                    return Err(LedgerError::fatal(
                        "chunk",
                        format!(
                            "requested chunk {} but ledger returned chunk {}",
                            reference.chunk_id, chunk.chunk_id
                        ),
                    ));
                }
                Ok(chunk)
            },
            |attempt, backoff, err, will_retry| {
                if will_retry {
                    self.telemetry.record_chunk_retry();
                    tracing::warn!(
                        height = request.height,
                        shard = reference.shard_id,
                        chunk = %reference.chunk_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "chunk fetch failed; retrying"
                    );
                } else {
                    tracing::error!(
                        height = request.height,
                        shard = reference.shard_id,
                        chunk = %reference.chunk_id,
                        attempt,
                        error = %err,
                        "chunk fetch failed; retries exhausted"
                    );
                }
            },
        )
        .await
        .map_err(|failure| failure.into_error())?;

        self.telemetry.record_chunk_fetched();
        tracing::trace!(
            height = request.height,
            shard = reference.shard_id,
            chunk = %reference.chunk_id,
            receipts = chunk.receipts.len(),
            "chunk fetched"
        );
        Ok(chunk)
    }
}

async fn next_request(requests: &SharedRequests) -> Option<ChunkRequest> {
    requests.lock().await.recv().await
}
