//! The manager task: admits poller emissions, hands chunk fetches to the
//! pool, collects results and dispatches complete blocks to the receipt
//! handler strictly in height order.

use super::chunk_pool::ChunkPool;
use super::messages::{PollerEvent, ReadyBlock, ReportReceiver, WorkerReport};
use super::reorder::{ChunkDisposition, NextStep, ProcessingState};
use crate::ledger::BlockHeight;
use crate::runtime::error::{IndexerError, PipelineStage};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::progress::ProgressTracker;
use crate::runtime::telemetry::{Telemetry, TelemetrySnapshot};
use anyhow::{anyhow, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

/// Summary returned once the pipeline has fully stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Highest height whose events were all emitted, if any.
    pub last_confirmed: Option<BlockHeight>,
    pub telemetry: TelemetrySnapshot,
}

pub(crate) struct Manager {
    state: ProcessingState,
    max_in_flight: usize,
    pool: ChunkPool,
    poller: mpsc::Receiver<PollerEvent>,
    reports: ReportReceiver,
    handler: mpsc::Sender<ReadyBlock>,
    handler_busy: bool,
    admitting: bool,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    progress: Arc<ProgressTracker>,
    telemetry: Arc<Telemetry>,
    fatal_handler: Arc<FatalErrorHandler>,
    shutdown: CancellationToken,
    join_timeout: Duration,
}

pub(crate) struct ManagerParams {
    pub watermark: BlockHeight,
    pub max_in_flight: usize,
    pub pool: ChunkPool,
    pub poller: mpsc::Receiver<PollerEvent>,
    pub reports: ReportReceiver,
    pub handler: mpsc::Sender<ReadyBlock>,
    pub tasks: Vec<(&'static str, JoinHandle<()>)>,
    pub progress: Arc<ProgressTracker>,
    pub telemetry: Arc<Telemetry>,
    pub fatal_handler: Arc<FatalErrorHandler>,
    pub shutdown: CancellationToken,
    pub join_timeout: Duration,
}

impl Manager {
    pub(crate) fn new(params: ManagerParams) -> Self {
        Self {
            state: ProcessingState::new(params.watermark),
            max_in_flight: params.max_in_flight.max(1),
            pool: params.pool,
            poller: params.poller,
            reports: params.reports,
            handler: params.handler,
            handler_busy: false,
            admitting: true,
            tasks: params.tasks,
            progress: params.progress,
            telemetry: params.telemetry,
            fatal_handler: params.fatal_handler,
            shutdown: params.shutdown,
            join_timeout: params.join_timeout,
        }
    }

    /// Drives the pipeline until cancellation or the first fatal error, then
    /// stops every task it owns.
    #[tracing::instrument(name = "manager", skip_all, fields(watermark = self.state.watermark()))]
    pub(crate) async fn run(mut self) -> Result<ShutdownReport> {
        if let Err(err) = self.drive().await {
            self.fatal_handler.trigger(err);
        }

        self.stop_tasks().await;

        let last_confirmed = self.progress.last_confirmed();
        if let Some(err) = self.fatal_handler.error() {
            let resume = last_confirmed.map_or_else(|| "none".to_string(), |h| h.to_string());
            return Err(err.context(format!(
                "indexer halted; last confirmed height {resume}"
            )));
        }

        tracing::info!(?last_confirmed, "pipeline stopped");
        Ok(ShutdownReport {
            last_confirmed,
            telemetry: self.telemetry.snapshot(),
        })
    }

    async fn drive(&mut self) -> Result<(), IndexerError> {
        loop {
            self.advance()?;

            let can_admit = self.admitting && self.state.in_flight() < self.max_in_flight;
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::info!(
                        watermark = self.state.watermark(),
                        in_flight = self.state.in_flight(),
                        "shutdown requested"
                    );
                    return Ok(());
                }
                report = self.reports.recv() => match report {
                    Some(report) => self.on_report(report)?,
                    None => {
                        return Err(IndexerError::new(
                            PipelineStage::Dispatch,
                            "pipeline",
                            anyhow!("every pipeline task exited"),
                        ));
                    }
                },
                event = self.poller.recv(), if can_admit => match event {
                    Some(event) => self.admit(event)?,
                    None => {
                        self.admitting = false;
                        if !self.shutdown.is_cancelled() {
                            return Err(IndexerError::new(
                                PipelineStage::Poll,
                                "block poller",
                                anyhow!("block poller stopped unexpectedly"),
                            ));
                        }
                    }
                },
            }
        }
    }

    /// Completes skipped heights and dispatches the lowest ready block, if the
    /// handler is free.
    fn advance(&mut self) -> Result<(), IndexerError> {
        loop {
            match self.state.next_step() {
                NextStep::Wait => return Ok(()),
                NextStep::CompleteSkipped(height) => {
                    self.state
                        .complete(height)
                        .map_err(|err| ordering_error(height, err))?;
                    self.confirm(height);
                    tracing::debug!(height, "skipped height confirmed");
                }
                NextStep::Dispatch(ready) => {
                    let height = ready.header.height;
                    let chunks = ready.chunks.len();
                    self.handler.try_send(ready).map_err(|err| {
                        IndexerError::new(
                            PipelineStage::Dispatch,
                            format!("block {height}"),
                            anyhow!("receipt handler unavailable: {err}"),
                        )
                    })?;
                    self.handler_busy = true;
                    tracing::debug!(height, chunks, "block dispatched to receipt handler");
                    return Ok(());
                }
            }
        }
    }

    fn admit(&mut self, event: PollerEvent) -> Result<(), IndexerError> {
        let height = event.height();
        let skipped = matches!(event, PollerEvent::Skipped(_));
        let requests = self.state.admit(event).map_err(|err| {
            IndexerError::new(PipelineStage::Poll, format!("block {height}"), err)
        })?;

        self.telemetry.record_block_admitted(self.state.in_flight());
        if skipped {
            self.telemetry.record_skipped_height();
            tracing::warn!(height, "ledger has no block at height; skipping");
            return Ok(());
        }

        tracing::debug!(height, chunks = requests.len(), "block admitted");
        for request in requests {
            if !self.pool.submit(request) {
                return Err(IndexerError::new(
                    PipelineStage::ChunkFetch,
                    format!("block {height}"),
                    anyhow!("chunk worker pool is closed"),
                ));
            }
        }
        Ok(())
    }

    fn on_report(&mut self, report: WorkerReport) -> Result<(), IndexerError> {
        match report {
            WorkerReport::ChunkFetched {
                height,
                index,
                chunk,
            } => match self.state.record_chunk(height, index, chunk) {
                ChunkDisposition::Accepted { block_ready } => {
                    if block_ready {
                        tracing::trace!(height, "all chunks resolved");
                    }
                }
                ChunkDisposition::Duplicate => {
                    tracing::warn!(height, index, "dropping duplicate chunk result");
                }
                ChunkDisposition::Unknown => {
                    tracing::warn!(height, index, "dropping chunk result for unknown block");
                }
            },
            WorkerReport::BlockHandled(height) => {
                if !self.handler_busy {
                    return Err(ordering_error(
                        height,
                        anyhow!("handler reported a block that was never dispatched"),
                    ));
                }
                self.state
                    .complete(height)
                    .map_err(|err| ordering_error(height, err))?;
                self.handler_busy = false;
                self.confirm(height);
                tracing::debug!(height, "block confirmed");
            }
            WorkerReport::Failed(err) => return Err(err),
        }
        Ok(())
    }

    fn confirm(&self, height: BlockHeight) {
        self.progress.mark_confirmed(height);
        self.telemetry.record_block_completed();
    }

    async fn stop_tasks(&mut self) {
        self.admitting = false;
        self.shutdown.cancel();

        let mut handles: Vec<(String, JoinHandle<()>)> = self
            .pool
            .shutdown()
            .into_iter()
            .enumerate()
            .map(|(id, handle)| (format!("chunk worker {id}"), handle))
            .collect();
        handles.extend(
            self.tasks
                .drain(..)
                .map(|(name, handle)| (name.to_string(), handle)),
        );

        let deadline = Instant::now() + self.join_timeout;
        join_all(handles.into_iter().map(|(name, mut handle)| async move {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(task = %name, error = %err, "pipeline task ended abnormally");
                }
                Err(_) => {
                    tracing::warn!(task = %name, "pipeline task did not stop in time; aborting");
                    handle.abort();
                }
            }
        }))
        .await;
    }
}

fn ordering_error(height: BlockHeight, err: anyhow::Error) -> IndexerError {
    IndexerError::new(PipelineStage::Dispatch, format!("block {height}"), err)
}
