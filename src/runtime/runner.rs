use crate::ledger::LedgerClient;
use crate::processor::indexer::Indexer;
use crate::processor::manager::ShutdownReport;
use crate::runtime::config::IndexerConfig;
use crate::runtime::policy::{EventDecoder, ReceiptFilter};
use crate::runtime::sink::{EventStream, IndexedEvent};
use anyhow::{Context, Result};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Coordinates the indexer lifecycle and handles OS signals for graceful shutdowns.
pub struct Runner<F, D: EventDecoder> {
    indexer: Indexer<F, D>,
    shutdown: CancellationToken,
    started: bool,
}

impl<F, D> Runner<F, D>
where
    F: ReceiptFilter,
    D: EventDecoder,
{
    /// Creates a new runner and wires a root [`CancellationToken`] that propagates
    /// through the whole pipeline.
    pub fn new(config: IndexerConfig, ledger: Arc<dyn LedgerClient>, filter: F, decoder: D) -> Self {
        let shutdown = CancellationToken::new();
        let indexer =
            Indexer::with_cancellation_token(config, ledger, filter, decoder, shutdown.clone());
        Self {
            indexer,
            shutdown,
            started: false,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn indexer(&self) -> &Indexer<F, D> {
        &self.indexer
    }

    /// Starts the pipeline and hands back its event stream.
    pub async fn start(&mut self) -> Result<EventStream<D::Event>> {
        let events = self.indexer.start().await?;
        self.started = true;
        Ok(events)
    }

    /// Stops the pipeline by cancelling the root token and waiting for the indexer.
    pub async fn stop(&mut self) -> Result<ShutdownReport> {
        if !self.started {
            return self.indexer.stop().await;
        }

        self.shutdown.cancel();
        let outcome = self.indexer.stop().await;
        self.started = false;
        self.reinitialize_shutdown_token();
        outcome
    }

    /// Starts the pipeline and feeds every event to `consume` until Ctrl-C
    /// (SIGINT), the shutdown token being cancelled elsewhere, or the pipeline
    /// ending on its own. An error from `consume` stops the pipeline and is
    /// returned.
    pub async fn run_until_ctrl_c<C, Fut>(&mut self, mut consume: C) -> Result<ShutdownReport>
    where
        C: FnMut(IndexedEvent<D::Event>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut events = self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut consumer_error = None;
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::info!("Ctrl-C received; shutting down runner");
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("runner shutdown token cancelled");
                    break;
                }
                event = events.next() => match event {
                    Some(event) => {
                        let height = event.height;
                        if let Err(err) = consume(event).await {
                            consumer_error =
                                Some(err.context(format!("event consumer failed at height {height}")));
                            break;
                        }
                    }
                    None => {
                        tracing::info!("event stream ended; pipeline stopped");
                        break;
                    }
                },
            }
        }

        // Stop before dropping the stream so a closed sink is not mistaken for a failure.
        let outcome = self.stop().await;
        drop(events);
        match consumer_error {
            Some(err) => Err(err),
            None => outcome.context("indexer stopped with an error"),
        }
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.indexer.replace_shutdown_root(self.shutdown.clone());
    }
}
