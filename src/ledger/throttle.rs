use super::{
    Block, BlockHeader, BlockHeight, Chunk, ChunkReference, LedgerClient, LedgerError,
    LedgerErrorKind, LedgerFuture, Outcome, OutcomeRequest,
};
use crate::runtime::telemetry::Telemetry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;

/// Shared wrapper around a [`LedgerClient`] that caps simultaneous calls,
/// enforces a hard per-call timeout and counts calls and failures.
pub struct ThrottledLedger {
    inner: Arc<dyn LedgerClient>,
    permits: Semaphore,
    call_timeout: Duration,
    telemetry: Arc<Telemetry>,
}

impl ThrottledLedger {
    pub fn new(
        inner: Arc<dyn LedgerClient>,
        max_concurrent_calls: usize,
        call_timeout: Duration,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_concurrent_calls.max(1)),
            call_timeout,
            telemetry,
        }
    }

    async fn call<T, Fut>(&self, operation: &'static str, future: Fut) -> Result<T, LedgerError>
    where
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LedgerError::fatal(operation, "ledger throttle closed"))?;

        self.telemetry.record_ledger_call();
        match timeout(self.call_timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if err.kind() == LedgerErrorKind::Timeout {
                    self.telemetry.record_ledger_timeout();
                } else {
                    self.telemetry.record_ledger_error();
                }
                Err(err)
            }
            Err(_) => {
                self.telemetry.record_ledger_timeout();
                Err(LedgerError::timeout(operation))
            }
        }
    }
}

impl LedgerClient for ThrottledLedger {
    fn get_latest_block(&self) -> LedgerFuture<'_, BlockHeader> {
        Box::pin(self.call("latest block", self.inner.get_latest_block()))
    }

    fn get_block(&self, height: BlockHeight) -> LedgerFuture<'_, Option<Block>> {
        Box::pin(self.call("block", self.inner.get_block(height)))
    }

    fn get_chunk<'a>(&'a self, reference: &'a ChunkReference) -> LedgerFuture<'a, Chunk> {
        Box::pin(self.call("chunk", self.inner.get_chunk(reference)))
    }

    fn get_receipt_outcome<'a>(&'a self, request: &'a OutcomeRequest) -> LedgerFuture<'a, Outcome> {
        Box::pin(self.call("receipt outcome", self.inner.get_receipt_outcome(request)))
    }
}
