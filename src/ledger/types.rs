//! Ledger data model shared by every pipeline stage. Values are transient:
//! created by a fetch and dropped once the next stage has consumed them.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type BlockHeight = u64;
pub type ShardId = u64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Unique block identifier (the block hash).
    BlockId
);
string_id!(
    /// Unique chunk identifier (the chunk hash).
    ChunkId
);
string_id!(ReceiptId);
string_id!(AccountId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: BlockHeight,
    pub id: BlockId,
    pub prev_id: BlockId,
}

/// A block together with the chunk references that must all be resolved
/// before the block counts as processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub chunks: Vec<ChunkReference>,
}

impl Block {
    pub fn height(&self) -> BlockHeight {
        self.header.height
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkReference {
    pub shard_id: ShardId,
    pub chunk_id: ChunkId,
}

impl ChunkReference {
    pub fn new(shard_id: ShardId, chunk_id: impl Into<ChunkId>) -> Self {
        Self {
            shard_id,
            chunk_id: chunk_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub shard_id: ShardId,
    pub receipts: Vec<Receipt>,
}

impl Chunk {
    pub fn reference(&self) -> ChunkReference {
        ChunkReference::new(self.shard_id, self.chunk_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptKind {
    Action,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: ReceiptId,
    pub receiver_id: AccountId,
    pub predecessor_id: AccountId,
    pub kind: ReceiptKind,
    pub payload: serde_json::Value,
    /// Present when the source already carried the execution outcome.
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Success,
    Failure(String),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub receipt_id: ReceiptId,
    pub executor_id: AccountId,
    pub logs: Vec<String>,
    pub status: OutcomeStatus,
    pub produced_receipts: Vec<ReceiptId>,
}

/// Parameters of an outcome lookup. Outcomes are answered relative to a
/// block, so the request carries the block whose chunk included the receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRequest {
    pub receipt_id: ReceiptId,
    pub receiver_id: AccountId,
    pub block_id: BlockId,
}

impl OutcomeRequest {
    pub fn for_receipt(receipt: &Receipt, block_id: &BlockId) -> Self {
        Self {
            receipt_id: receipt.id.clone(),
            receiver_id: receipt.receiver_id.clone(),
            block_id: block_id.clone(),
        }
    }
}
