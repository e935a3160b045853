//! Manager-owned processing state: which blocks are in flight, which of their
//! chunks are still missing and how far the watermark has advanced.

use super::messages::{ChunkRequest, PollerEvent, ReadyBlock};
use crate::ledger::{Block, BlockHeader, BlockHeight, Chunk, ChunkReference};
use anyhow::{bail, Result};
use std::collections::BTreeMap;

enum Slot {
    Skipped,
    Block {
        header: BlockHeader,
        references: Vec<ChunkReference>,
        chunks: Vec<Option<Chunk>>,
        pending: usize,
        dispatched: bool,
    },
}

impl Slot {
    fn is_ready(&self) -> bool {
        match self {
            Slot::Skipped => true,
            Slot::Block { pending, .. } => *pending == 0,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChunkDisposition {
    Accepted { block_ready: bool },
    Duplicate,
    Unknown,
}

/// Next action for the lowest in-flight height.
#[derive(Debug)]
pub(crate) enum NextStep {
    /// Nothing can move until chunks arrive or the handler finishes.
    Wait,
    /// The height had no block; it can be completed right away.
    CompleteSkipped(BlockHeight),
    Dispatch(ReadyBlock),
}

pub(crate) struct ProcessingState {
    watermark: BlockHeight,
    next_admit: BlockHeight,
    blocks: BTreeMap<BlockHeight, Slot>,
}

impl ProcessingState {
    pub(crate) fn new(watermark: BlockHeight) -> Self {
        Self {
            watermark,
            next_admit: watermark.saturating_add(1),
            blocks: BTreeMap::new(),
        }
    }

    pub(crate) fn watermark(&self) -> BlockHeight {
        self.watermark
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.blocks.len()
    }

    /// Admits the next poller emission and returns the chunk fetches it needs.
    pub(crate) fn admit(&mut self, event: PollerEvent) -> Result<Vec<ChunkRequest>> {
        let height = event.height();
        if height != self.next_admit {
            bail!(
                "poller emitted height {height} while height {} was expected",
                self.next_admit
            );
        }
        self.next_admit = height.saturating_add(1);

        match event {
            PollerEvent::Skipped(height) => {
                self.blocks.insert(height, Slot::Skipped);
                Ok(Vec::new())
            }
            PollerEvent::Block(Block { header, chunks }) => {
                let requests = chunks
                    .iter()
                    .enumerate()
                    .map(|(index, reference)| ChunkRequest {
                        height,
                        index,
                        reference: reference.clone(),
                    })
                    .collect();
                let pending = chunks.len();
                self.blocks.insert(
                    height,
                    Slot::Block {
                        header,
                        chunks: vec![None; pending],
                        references: chunks,
                        pending,
                        dispatched: false,
                    },
                );
                Ok(requests)
            }
        }
    }

    pub(crate) fn record_chunk(
        &mut self,
        height: BlockHeight,
        index: usize,
        chunk: Chunk,
    ) -> ChunkDisposition {
        let Some(Slot::Block {
            references,
            chunks,
            pending,
            ..
        }) = self.blocks.get_mut(&height)
        else {
            return ChunkDisposition::Unknown;
        };

        match (references.get(index), chunks.get_mut(index)) {
            (Some(reference), Some(slot)) if reference.chunk_id == chunk.chunk_id => {
                if slot.is_some() {
                    return ChunkDisposition::Duplicate;
                }
                *slot = Some(chunk);
                *pending -= 1;
                ChunkDisposition::Accepted {
                    block_ready: *pending == 0,
                }
            }
            _ => ChunkDisposition::Unknown,
        }
    }

    /// Looks at the lowest in-flight height only: nothing above it may be
    /// dispatched before it completes.
    pub(crate) fn next_step(&mut self) -> NextStep {
        let Some((&height, slot)) = self.blocks.iter_mut().next() else {
            return NextStep::Wait;
        };
        if !slot.is_ready() {
            return NextStep::Wait;
        }

        match slot {
            Slot::Skipped => NextStep::CompleteSkipped(height),
            Slot::Block { dispatched: true, .. } => NextStep::Wait,
            Slot::Block {
                header,
                chunks,
                dispatched,
                ..
            } => {
                *dispatched = true;
                NextStep::Dispatch(ReadyBlock {
                    header: header.clone(),
                    chunks: chunks.iter_mut().filter_map(Option::take).collect(),
                })
            }
        }
    }

    /// Marks the lowest in-flight height done and advances the watermark.
    pub(crate) fn complete(&mut self, height: BlockHeight) -> Result<()> {
        let Some(entry) = self.blocks.first_entry() else {
            bail!("completion for height {height} with no block in flight");
        };
        if *entry.key() != height {
            bail!(
                "completion for height {height} while height {} is next",
                entry.key()
            );
        }
        match entry.get() {
            Slot::Skipped | Slot::Block { dispatched: true, .. } => {}
            Slot::Block { .. } => bail!("completion for height {height} before dispatch"),
        }

        entry.remove();
        self.watermark = height;
        Ok(())
    }
}
