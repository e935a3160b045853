pub mod ledger;
pub mod processor;
pub mod receipts;
pub mod rpc;
pub mod runtime;

pub use ledger::{
    AccountId, Block, BlockHeader, BlockHeight, BlockId, Chunk, ChunkId, ChunkReference,
    LedgerClient, LedgerError, LedgerErrorKind, LedgerFuture, Outcome, OutcomeRequest,
    OutcomeStatus, Receipt, ReceiptId, ReceiptKind, ShardId, ThrottledLedger,
};
pub use processor::indexer::Indexer;
pub use processor::manager::ShutdownReport;
pub use receipts::{ContractEvents, EventLog, EventLogDecoder, ReceiverFilter, RecentReceipts};
pub use rpc::{NearRpcClient, RpcClientOptions};
pub use runtime::config::{IndexerConfig, IndexerConfigBuilder, IndexerConfigParams};
pub use runtime::error::{IndexerError, PipelineStage};
pub use runtime::policy::{EventDecoder, ReceiptFilter};
pub use runtime::runner::Runner;
pub use runtime::sink::{EventStream, IndexedEvent};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
