use crate::ledger::{Block, BlockHeader, BlockHeight, Chunk, ChunkReference};
use crate::runtime::error::IndexerError;
use tokio::sync::mpsc;

/// Emitted by the block poller, one per height, in strictly increasing order.
#[derive(Debug)]
pub(crate) enum PollerEvent {
    Block(Block),
    Skipped(BlockHeight),
}

impl PollerEvent {
    pub(crate) fn height(&self) -> BlockHeight {
        match self {
            PollerEvent::Block(block) => block.height(),
            PollerEvent::Skipped(height) => *height,
        }
    }
}

/// One chunk fetch handed to the worker pool. `index` is the position of the
/// reference inside its block.
#[derive(Debug, Clone)]
pub(crate) struct ChunkRequest {
    pub height: BlockHeight,
    pub index: usize,
    pub reference: ChunkReference,
}

/// A block whose chunks are all resolved, in the block's chunk order.
#[derive(Debug)]
pub(crate) struct ReadyBlock {
    pub header: BlockHeader,
    pub chunks: Vec<Chunk>,
}

/// Messages flowing back to the manager from every worker task.
#[derive(Debug)]
pub(crate) enum WorkerReport {
    ChunkFetched {
        height: BlockHeight,
        index: usize,
        chunk: Chunk,
    },
    BlockHandled(BlockHeight),
    Failed(IndexerError),
}

pub(crate) type ReportSender = mpsc::Sender<WorkerReport>;
pub(crate) type ReportReceiver = mpsc::Receiver<WorkerReport>;
