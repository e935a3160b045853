use std::{
    collections::{BTreeMap, HashMap},
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use serde_json::json;
use shardwatch::{
    AccountId, Block, BlockHeader, BlockHeight, BlockId, Chunk, ChunkId, ChunkReference,
    LedgerClient, LedgerError, LedgerErrorKind, LedgerFuture, Outcome, OutcomeRequest,
    OutcomeStatus, Receipt, ReceiptId, ReceiptKind,
};

pub const APP_ACCOUNT: &str = "app.near";

/// In-memory sharded ledger. Every block carries one chunk per shard and every
/// chunk one action receipt to [`APP_ACCOUNT`] whose outcome logs a NEP-297
/// event naming the block height.
pub struct MockLedger {
    latest: AtomicU64,
    state: Mutex<ChainState>,
    chunk_active: AtomicUsize,
    chunk_peak: AtomicUsize,
    outcome_calls: AtomicUsize,
}

#[derive(Default)]
struct ChainState {
    blocks: BTreeMap<BlockHeight, Block>,
    chunks: HashMap<String, Chunk>,
    outcomes: HashMap<String, Outcome>,
    chunk_failures: HashMap<String, (usize, LedgerErrorKind)>,
    chunk_delays: HashMap<String, Duration>,
    chunk_calls: HashMap<String, usize>,
    outcome_delays: HashMap<String, Duration>,
}

impl MockLedger {
    pub fn chain(heights: RangeInclusive<BlockHeight>, shards: u64) -> Self {
        let ledger = Self {
            latest: AtomicU64::new(*heights.end()),
            state: Mutex::new(ChainState::default()),
            chunk_active: AtomicUsize::new(0),
            chunk_peak: AtomicUsize::new(0),
            outcome_calls: AtomicUsize::new(0),
        };
        for height in heights {
            ledger.add_block(height, shards);
        }
        ledger
    }

    pub fn add_block(&self, height: BlockHeight, shards: u64) {
        let mut state = self.state.lock().unwrap();
        let mut references = Vec::new();
        for shard in 0..shards {
            let chunk_id = chunk_id(height, shard);
            let receipt_id = receipt_id(height, shard);
            let receipt = Receipt {
                id: ReceiptId::new(receipt_id.as_str()),
                receiver_id: AccountId::new(APP_ACCOUNT),
                predecessor_id: AccountId::new("alice.near"),
                kind: ReceiptKind::Action,
                payload: json!({"actions": [{"FunctionCall": {"method_name": "post"}}]}),
                outcome: None,
            };
            state.outcomes.insert(
                receipt_id.clone(),
                Outcome {
                    receipt_id: ReceiptId::new(receipt_id.as_str()),
                    executor_id: AccountId::new(APP_ACCOUNT),
                    logs: vec![format!(
                        r#"EVENT_JSON:{{"standard":"nep297","version":"1.0.0","event":"post","data":{{"height":{height},"shard":{shard}}}}}"#
                    )],
                    status: OutcomeStatus::Success,
                    produced_receipts: Vec::new(),
                },
            );
            state.chunks.insert(
                chunk_id.clone(),
                Chunk {
                    chunk_id: ChunkId::new(chunk_id.as_str()),
                    shard_id: shard,
                    receipts: vec![receipt],
                },
            );
            references.push(ChunkReference::new(shard, chunk_id));
        }

        state.blocks.insert(
            height,
            Block {
                header: header(height),
                chunks: references,
            },
        );
    }

    pub fn set_latest(&self, height: BlockHeight) {
        self.latest.store(height, Ordering::SeqCst);
    }

    /// Drops the block so the height reads as never produced.
    pub fn remove_block(&self, height: BlockHeight) {
        self.state.lock().unwrap().blocks.remove(&height);
    }

    /// Duplicates the first receipt of `from` into the chunk `into`.
    pub fn copy_receipt(&self, from: &str, into: &str) {
        let mut state = self.state.lock().unwrap();
        let receipt = state.chunks[from].receipts[0].clone();
        if let Some(chunk) = state.chunks.get_mut(into) {
            chunk.receipts.push(receipt);
        }
    }

    pub fn fail_chunk(&self, chunk: &str, times: usize, kind: LedgerErrorKind) {
        self.state
            .lock()
            .unwrap()
            .chunk_failures
            .insert(chunk.to_owned(), (times, kind));
    }

    pub fn delay_chunk(&self, chunk: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .chunk_delays
            .insert(chunk.to_owned(), delay);
    }

    /// Holds the next outcome lookup of `receipt` for `delay`; later lookups
    /// answer at once.
    pub fn delay_outcome_once(&self, receipt: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .outcome_delays
            .insert(receipt.to_owned(), delay);
    }

    pub fn chunk_calls(&self, chunk: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .chunk_calls
            .get(chunk)
            .copied()
            .unwrap_or(0)
    }

    pub fn peak_chunk_concurrency(&self) -> usize {
        self.chunk_peak.load(Ordering::SeqCst)
    }

    pub fn outcome_calls(&self) -> usize {
        self.outcome_calls.load(Ordering::SeqCst)
    }
}

impl LedgerClient for MockLedger {
    fn get_latest_block(&self) -> LedgerFuture<'_, BlockHeader> {
        let latest = self.latest.load(Ordering::SeqCst);
        Box::pin(async move { Ok(header(latest)) })
    }

    fn get_block(&self, height: BlockHeight) -> LedgerFuture<'_, Option<Block>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            Ok(self.state.lock().unwrap().blocks.get(&height).cloned())
        })
    }

    fn get_chunk<'a>(&'a self, reference: &'a ChunkReference) -> LedgerFuture<'a, Chunk> {
        Box::pin(async move {
            let id = reference.chunk_id.as_str();
            let active = self.chunk_active.fetch_add(1, Ordering::SeqCst) + 1;
            self.chunk_peak.fetch_max(active, Ordering::SeqCst);
            let _active = ActiveGuard(&self.chunk_active);

            let (delay, failure) = {
                let mut state = self.state.lock().unwrap();
                *state.chunk_calls.entry(id.to_owned()).or_default() += 1;
                let failure = match state.chunk_failures.get_mut(id) {
                    Some((remaining, kind)) if *remaining > 0 => {
                        *remaining -= 1;
                        Some(*kind)
                    }
                    _ => None,
                };
                (state.chunk_delays.get(id).copied(), failure)
            };

            tokio::time::sleep(delay.unwrap_or(Duration::from_millis(2))).await;
            if let Some(kind) = failure {
                return Err(LedgerError::new(kind, "chunk", format!("injected failure for {id}")));
            }

            self.state
                .lock()
                .unwrap()
                .chunks
                .get(id)
                .cloned()
                .ok_or_else(|| LedgerError::not_found("chunk", format!("unknown chunk {id}")))
        })
    }

    fn get_receipt_outcome<'a>(&'a self, request: &'a OutcomeRequest) -> LedgerFuture<'a, Outcome> {
        Box::pin(async move {
            self.outcome_calls.fetch_add(1, Ordering::SeqCst);
            let id = request.receipt_id.as_str();
            let delay = self.state.lock().unwrap().outcome_delays.remove(id);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.state
                .lock()
                .unwrap()
                .outcomes
                .get(id)
                .cloned()
                .ok_or_else(|| LedgerError::not_found("receipt outcome", format!("unknown receipt {id}")))
        })
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn chunk_id(height: BlockHeight, shard: u64) -> String {
    format!("c{height}-{shard}")
}

pub fn receipt_id(height: BlockHeight, shard: u64) -> String {
    format!("r{height}-{shard}")
}

fn header(height: BlockHeight) -> BlockHeader {
    BlockHeader {
        height,
        id: BlockId::new(format!("b{height}")),
        prev_id: BlockId::new(format!("b{}", height.saturating_sub(1))),
    }
}
