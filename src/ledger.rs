//! Ledger data model and the query interface the pipeline consumes.

pub mod error;
pub mod throttle;
pub mod types;

pub use error::{LedgerError, LedgerErrorKind};
pub use throttle::ThrottledLedger;
pub use types::{
    AccountId, Block, BlockHeader, BlockHeight, BlockId, Chunk, ChunkId, ChunkReference, Outcome,
    OutcomeRequest, OutcomeStatus, Receipt, ReceiptId, ReceiptKind, ShardId,
};

use futures::future::BoxFuture;

pub type LedgerFuture<'a, T> = BoxFuture<'a, Result<T, LedgerError>>;

/// Remote query interface of the ledger.
///
/// Implementations must be safe to call concurrently from every pipeline task.
pub trait LedgerClient: Send + Sync {
    /// Header of the most recent final block.
    fn get_latest_block(&self) -> LedgerFuture<'_, BlockHeader>;

    /// Block at `height`, or `None` when the ledger produced no block there.
    fn get_block(&self, height: BlockHeight) -> LedgerFuture<'_, Option<Block>>;

    fn get_chunk<'a>(&'a self, reference: &'a ChunkReference) -> LedgerFuture<'a, Chunk>;

    fn get_receipt_outcome<'a>(&'a self, request: &'a OutcomeRequest) -> LedgerFuture<'a, Outcome>;
}
