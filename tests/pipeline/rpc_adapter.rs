use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{collect_events, heights, init_tracing, test_config, wait_for_height},
    mock_ledger::APP_ACCOUNT,
    mock_rpc::{MockNearChain, MockRpcServer},
};
use anyhow::Result;
use shardwatch::{
    AccountId, BlockId, ChunkReference, EventLogDecoder, Indexer, LedgerClient, LedgerErrorKind,
    NearRpcClient, OutcomeRequest, OutcomeStatus, ReceiptId, ReceiptKind, ReceiverFilter,
    RpcClientOptions,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rpc_client_reads_blocks_chunks_and_outcomes() -> Result<()> {
    init_tracing();
    let chain = MockNearChain::new(1..=20, 2);
    chain.exclude_chunk(15, 1);
    let server = MockRpcServer::start(chain.clone()).await?;
    let client = NearRpcClient::new(server.url())?;

    let tip = client.get_latest_block().await?;
    assert_eq!(tip.height, 20);
    assert_eq!(tip.id.as_str(), "H20");
    assert_eq!(tip.prev_id.as_str(), "H19");

    let block = client.get_block(15).await?.expect("block 15 exists");
    assert_eq!(block.height(), 15);
    assert_eq!(
        block.chunks,
        vec![ChunkReference::new(0, "C15-0")],
        "chunks outside the mask must be dropped"
    );
    assert!(client.get_block(25).await?.is_none());

    let chunk = client.get_chunk(&block.chunks[0]).await?;
    assert_eq!(chunk.shard_id, 0);
    assert_eq!(chunk.receipts.len(), 1);
    let receipt = &chunk.receipts[0];
    assert_eq!(receipt.id.as_str(), "R15-0");
    assert_eq!(receipt.receiver_id.as_str(), APP_ACCOUNT);
    assert_eq!(receipt.kind, ReceiptKind::Action);

    let request = OutcomeRequest {
        receipt_id: ReceiptId::new("R15-0"),
        receiver_id: AccountId::new(APP_ACCOUNT),
        block_id: BlockId::new("H15"),
    };
    let outcome = client.get_receipt_outcome(&request).await?;
    assert_eq!(outcome.receipt_id, request.receipt_id);
    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(outcome.logs.len(), 1);
    assert!(outcome.logs[0].starts_with("EVENT_JSON:"));
    assert_eq!(chain.head_hops(), 1, "the head should move once");

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rpc_client_classifies_unknown_chunks_and_sends_api_key() -> Result<()> {
    init_tracing();
    let chain = MockNearChain::new(1..=5, 1);
    let server = MockRpcServer::start(chain.clone()).await?;
    let options = RpcClientOptions {
        api_key: Some("secret-key".to_owned()),
        ..RpcClientOptions::default()
    };
    let client = NearRpcClient::with_options(server.url(), options)?;

    let err = client
        .get_chunk(&ChunkReference::new(0, "C99-0"))
        .await
        .expect_err("unknown chunk should fail");
    assert_eq!(err.kind(), LedgerErrorKind::NotFound);
    assert_eq!(err.operation(), "chunk");

    let keys = chain.seen_api_keys();
    assert!(!keys.is_empty());
    assert!(keys.iter().all(|key| key.as_deref() == Some("secret-key")));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rpc_pipeline_indexes_events_end_to_end() -> Result<()> {
    init_tracing();
    let chain = MockNearChain::new(1..=20, 2);
    chain.mark_missing(19);
    chain.exclude_chunk(18, 1);
    let server = MockRpcServer::start(chain.clone()).await?;

    let config = test_config()
        .rpc_url(server.url())
        .start_after(17)
        .chunk_workers(2)
        .build()?;
    let ledger: Arc<dyn LedgerClient> = Arc::new(NearRpcClient::from_config(&config)?);
    let mut indexer = Indexer::new(
        config,
        ledger,
        ReceiverFilter::new(APP_ACCOUNT),
        EventLogDecoder,
    );

    let mut events = indexer.start().await?;
    let delivered = collect_events(&mut events, 3, Duration::from_secs(5)).await?;
    wait_for_height(&indexer, 20, Duration::from_secs(5)).await?;
    let report = indexer.stop().await?;

    assert_eq!(heights(&delivered), vec![18, 20, 20]);
    let payload = delivered[0].event.events[0]
        .data
        .clone()
        .expect("event carries data");
    assert_eq!(payload["height"], 18);
    assert_eq!(payload["shard"], 0);
    assert_eq!(report.telemetry.skipped_heights, 1);
    assert_eq!(report.last_confirmed, Some(20));
    assert!(chain.head_hops() >= 3);

    server.shutdown().await;
    Ok(())
}
