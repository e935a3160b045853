//! Wire shapes of the NEAR-style JSON-RPC responses and their conversion into
//! ledger types. Only the fields the pipeline reads are modelled.

use crate::ledger::{
    AccountId, Block, BlockHeader, BlockId, Chunk, ChunkId, ChunkReference, Outcome,
    OutcomeStatus, Receipt, ReceiptId, ReceiptKind,
};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub(crate) struct BlockView {
    pub header: BlockHeaderView,
    #[serde(default)]
    pub chunks: Vec<ChunkHeaderView>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BlockHeaderView {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    #[serde(default)]
    pub chunk_mask: Vec<bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChunkHeaderView {
    pub chunk_hash: String,
    pub shard_id: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChunkView {
    pub header: ChunkHeaderView,
    #[serde(default)]
    pub receipts: Vec<ReceiptView>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReceiptView {
    pub predecessor_id: String,
    pub receiver_id: String,
    pub receipt_id: String,
    pub receipt: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LightClientProofView {
    pub outcome_proof: OutcomeWithIdView,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OutcomeWithIdView {
    pub id: String,
    pub outcome: OutcomeView,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OutcomeView {
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub receipt_ids: Vec<String>,
    pub executor_id: String,
    pub status: Value,
}

impl BlockView {
    pub(crate) fn header(&self) -> BlockHeader {
        BlockHeader {
            height: self.header.height,
            id: BlockId::new(self.header.hash.as_str()),
            prev_id: BlockId::new(self.header.prev_hash.as_str()),
        }
    }

    /// Keeps the chunks the block actually includes. An empty mask means
    /// every listed chunk is included.
    pub(crate) fn into_block(self) -> Block {
        let header = self.header();
        let mask = self.header.chunk_mask;
        let chunks = self
            .chunks
            .into_iter()
            .enumerate()
            .filter(|(index, _)| mask.is_empty() || mask.get(*index).copied().unwrap_or(false))
            .map(|(_, chunk)| ChunkReference::new(chunk.shard_id, chunk.chunk_hash))
            .collect();
        Block { header, chunks }
    }
}

impl From<ChunkView> for Chunk {
    fn from(view: ChunkView) -> Self {
        Chunk {
            chunk_id: ChunkId::new(view.header.chunk_hash),
            shard_id: view.header.shard_id,
            receipts: view.receipts.into_iter().map(Receipt::from).collect(),
        }
    }
}

impl From<ReceiptView> for Receipt {
    fn from(view: ReceiptView) -> Self {
        let (kind, payload) = match view.receipt {
            Value::Object(mut body) => {
                if let Some(data) = body.remove("Data") {
                    (ReceiptKind::Data, data)
                } else if let Some(action) = body.remove("Action") {
                    (ReceiptKind::Action, action)
                } else {
                    (ReceiptKind::Action, Value::Object(body))
                }
            }
            other => (ReceiptKind::Action, other),
        };

        Receipt {
            id: ReceiptId::new(view.receipt_id),
            receiver_id: AccountId::new(view.receiver_id),
            predecessor_id: AccountId::new(view.predecessor_id),
            kind,
            payload,
            outcome: None,
        }
    }
}

impl From<OutcomeWithIdView> for Outcome {
    fn from(view: OutcomeWithIdView) -> Self {
        Outcome {
            receipt_id: ReceiptId::new(view.id),
            executor_id: AccountId::new(view.outcome.executor_id),
            logs: view.outcome.logs,
            status: parse_status(&view.outcome.status),
            produced_receipts: view
                .outcome
                .receipt_ids
                .into_iter()
                .map(ReceiptId::new)
                .collect(),
        }
    }
}

fn parse_status(status: &Value) -> OutcomeStatus {
    match status {
        Value::Object(body) if body.contains_key("Failure") => {
            OutcomeStatus::Failure(body.get("Failure").map(Value::to_string).unwrap_or_default())
        }
        Value::Object(body)
            if body.contains_key("SuccessValue") || body.contains_key("SuccessReceiptId") =>
        {
            OutcomeStatus::Success
        }
        _ => OutcomeStatus::Unknown,
    }
}
