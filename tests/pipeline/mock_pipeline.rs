use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::support::{
    helpers::{
        assert_non_decreasing, collect_events, heights, init_tracing, test_config,
        wait_for_height,
    },
    mock_ledger::{chunk_id, receipt_id, MockLedger, APP_ACCOUNT},
};
use anyhow::{bail, Result};
use shardwatch::{
    EventLogDecoder, Indexer, IndexerConfig, IndexerError, LedgerClient, LedgerErrorKind,
    PipelineStage, ReceiverFilter,
};
use tokio::time::{sleep, timeout};

type TestIndexer = Indexer<ReceiverFilter, EventLogDecoder>;

fn indexer(ledger: &Arc<MockLedger>, config: IndexerConfig) -> TestIndexer {
    let ledger: Arc<dyn LedgerClient> = ledger.clone();
    Indexer::new(config, ledger, ReceiverFilter::new(APP_ACCOUNT), EventLogDecoder)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mock_pipeline_emits_events_in_height_order() -> Result<()> {
    init_tracing();
    let ledger = Arc::new(MockLedger::chain(90..=100, 3));
    let config = test_config()
        .start_after(97)
        .chunk_workers(4)
        .max_in_flight_blocks(3)
        .build()?;
    let mut indexer = indexer(&ledger, config);

    let mut events = indexer.start().await?;
    let delivered = collect_events(&mut events, 9, Duration::from_secs(5)).await?;
    wait_for_height(&indexer, 100, Duration::from_secs(5)).await?;
    let report = indexer.stop().await?;

    assert_eq!(
        heights(&delivered),
        vec![98, 98, 98, 99, 99, 99, 100, 100, 100]
    );
    let receipts: Vec<String> = delivered
        .iter()
        .map(|event| event.receipt_id.to_string())
        .collect();
    let expected: Vec<String> = (98..=100)
        .flat_map(|height| (0..3).map(move |shard| receipt_id(height, shard)))
        .collect();
    assert_eq!(receipts, expected, "receipts must follow chunk order within a block");

    let first = &delivered[0].event;
    assert_eq!(first.executor_id.as_str(), APP_ACCOUNT);
    assert_eq!(first.events.len(), 1);
    assert_eq!(first.events[0].event, "post");

    assert_eq!(report.last_confirmed, Some(100));
    assert_eq!(report.telemetry.blocks_completed, 3);
    assert_eq!(report.telemetry.chunks_fetched, 9);
    assert_eq!(report.telemetry.events_emitted, 9);
    assert_eq!(ledger.outcome_calls(), 9);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mock_pipeline_retries_transient_chunk_failures() -> Result<()> {
    init_tracing();
    let ledger = Arc::new(MockLedger::chain(90..=100, 3));
    let flaky = chunk_id(99, 1);
    ledger.fail_chunk(&flaky, 3, LedgerErrorKind::Transient);

    let config = test_config().start_after(97).chunk_workers(3).build()?;
    let mut indexer = indexer(&ledger, config);

    let mut events = indexer.start().await?;
    let delivered = collect_events(&mut events, 9, Duration::from_secs(5)).await?;
    wait_for_height(&indexer, 100, Duration::from_secs(5)).await?;
    let report = indexer.stop().await?;

    assert_non_decreasing(&heights(&delivered));
    let at_99 = delivered.iter().filter(|event| event.height == 99).count();
    assert_eq!(at_99, 3, "no receipt of block 99 may be lost");
    assert_eq!(ledger.chunk_calls(&flaky), 4);
    assert!(
        report.telemetry.chunk_retries >= 3,
        "expected at least 3 chunk retries, got {}",
        report.telemetry.chunk_retries
    );
    assert_eq!(report.last_confirmed, Some(100));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mock_pipeline_stops_promptly_with_pending_chunks() -> Result<()> {
    init_tracing();
    let ledger = Arc::new(MockLedger::chain(90..=100, 2));
    ledger.delay_chunk(&chunk_id(98, 0), Duration::from_secs(30));

    let config = test_config().start_after(97).chunk_workers(2).build()?;
    let mut indexer = indexer(&ledger, config);
    let mut events = indexer.start().await?;

    sleep(Duration::from_millis(150)).await;
    let started = Instant::now();
    let report = timeout(Duration::from_secs(4), indexer.stop()).await??;

    assert!(
        started.elapsed() < Duration::from_secs(4),
        "stop took {:?}",
        started.elapsed()
    );
    assert!(!indexer.is_running());
    assert_eq!(report.last_confirmed, Some(97));
    assert_eq!(indexer.last_confirmed_height(), Some(97));

    let leftover = timeout(Duration::from_secs(1), events.recv()).await?;
    assert!(
        leftover.is_none(),
        "no event may be emitted for an unfinished block"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mock_pipeline_respects_concurrency_limits() -> Result<()> {
    init_tracing();
    let ledger = Arc::new(MockLedger::chain(0..=40, 4));
    let config = test_config()
        .start_after(0)
        .chunk_workers(2)
        .max_in_flight_blocks(3)
        .build()?;
    let mut indexer = indexer(&ledger, config);

    let mut events = indexer.start().await?;
    let delivered = collect_events(&mut events, 160, Duration::from_secs(10)).await?;
    wait_for_height(&indexer, 40, Duration::from_secs(5)).await?;
    let report = indexer.stop().await?;

    assert_non_decreasing(&heights(&delivered));
    assert!(
        ledger.peak_chunk_concurrency() <= 2,
        "chunk fetches exceeded the worker count: {}",
        ledger.peak_chunk_concurrency()
    );
    assert!(
        report.telemetry.peak_in_flight_blocks <= 3,
        "in-flight blocks exceeded the limit: {}",
        report.telemetry.peak_in_flight_blocks
    );
    assert!(report.telemetry.peak_in_flight_blocks >= 1);
    assert_eq!(report.telemetry.blocks_completed, 40);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mock_pipeline_halts_on_permanent_chunk_failure() -> Result<()> {
    init_tracing();
    let ledger = Arc::new(MockLedger::chain(90..=100, 2));
    ledger.fail_chunk(&chunk_id(99, 1), usize::MAX, LedgerErrorKind::Transient);

    let config = test_config().start_after(97).max_attempts(3).build()?;
    let mut indexer = indexer(&ledger, config);
    let mut events = indexer.start().await?;

    let mut delivered = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_secs(5), events.recv()).await {
        delivered.push(event);
    }

    let err = match timeout(Duration::from_secs(5), indexer.wait()).await? {
        Ok(report) => bail!("pipeline should have failed, stopped at {report:?}"),
        Err(err) => err,
    };
    let fatal = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<IndexerError>())
        .expect("fatal error should carry an IndexerError");
    assert_eq!(fatal.stage(), PipelineStage::ChunkFetch);
    assert_eq!(fatal.target(), "block 99 shard 1 chunk c99-1");
    assert!(format!("{err:#}").contains("last confirmed height"));

    assert!(
        delivered.iter().all(|event| event.height < 99),
        "nothing at or past the failed block may be emitted: {:?}",
        heights(&delivered)
    );
    assert_eq!(ledger.chunk_calls(&chunk_id(99, 1)), 3);
    assert!(indexer.last_confirmed_height().is_some_and(|height| height < 99));
    assert!(indexer.cancellation_token().is_cancelled());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mock_pipeline_steps_over_skipped_heights() -> Result<()> {
    init_tracing();
    let ledger = Arc::new(MockLedger::chain(90..=100, 2));
    ledger.remove_block(99);

    let config = test_config().start_after(97).build()?;
    let mut indexer = indexer(&ledger, config);

    let mut events = indexer.start().await?;
    let delivered = collect_events(&mut events, 4, Duration::from_secs(5)).await?;
    wait_for_height(&indexer, 100, Duration::from_secs(5)).await?;
    let report = indexer.stop().await?;

    assert_eq!(heights(&delivered), vec![98, 98, 100, 100]);
    assert_eq!(report.telemetry.skipped_heights, 1);
    assert_eq!(report.telemetry.blocks_completed, 2);
    assert_eq!(report.last_confirmed, Some(100));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mock_pipeline_emits_duplicate_receipts_once() -> Result<()> {
    init_tracing();
    let ledger = Arc::new(MockLedger::chain(90..=100, 3));
    ledger.copy_receipt(&chunk_id(99, 0), &chunk_id(99, 2));

    let config = test_config().start_after(97).build()?;
    let mut indexer = indexer(&ledger, config);

    let mut events = indexer.start().await?;
    let delivered = collect_events(&mut events, 9, Duration::from_secs(5)).await?;
    wait_for_height(&indexer, 100, Duration::from_secs(5)).await?;
    let report = indexer.stop().await?;

    let duplicated = receipt_id(99, 0);
    let copies = delivered
        .iter()
        .filter(|event| event.receipt_id.as_str() == duplicated)
        .count();
    assert_eq!(copies, 1, "a receipt seen twice must be emitted once");
    assert_eq!(report.telemetry.duplicate_receipts, 1);
    assert_eq!(report.telemetry.events_emitted, 9);
    assert!(events.try_recv().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mock_pipeline_starts_at_the_tip_without_start_height() -> Result<()> {
    init_tracing();
    let ledger = Arc::new(MockLedger::chain(1..=50, 2));
    let config = test_config().build()?;
    let mut indexer = indexer(&ledger, config);

    let mut events = indexer.start().await?;
    assert_eq!(indexer.last_confirmed_height(), Some(50));

    ledger.add_block(51, 2);
    ledger.set_latest(51);
    let delivered = collect_events(&mut events, 2, Duration::from_secs(5)).await?;
    wait_for_height(&indexer, 51, Duration::from_secs(5)).await?;
    let report = indexer.stop().await?;

    assert_eq!(heights(&delivered), vec![51, 51]);
    assert_eq!(report.telemetry.blocks_completed, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mock_pipeline_restart_mid_block_skips_emitted_receipts() -> Result<()> {
    init_tracing();
    let ledger = Arc::new(MockLedger::chain(0..=1, 2));
    ledger.delay_outcome_once(&receipt_id(1, 1), Duration::from_secs(30));

    let config = test_config()
        .start_after(0)
        .outcome_concurrency(1)
        .rpc_timeout(Duration::from_secs(10))
        .build()?;
    let mut indexer = indexer(&ledger, config);

    let mut events = indexer.start().await?;
    let first = collect_events(&mut events, 1, Duration::from_secs(5)).await?;
    assert_eq!(first[0].receipt_id.as_str(), receipt_id(1, 0));
    let report = timeout(Duration::from_secs(4), indexer.stop()).await??;
    drop(events);
    assert_eq!(report.last_confirmed, Some(0), "block 1 was interrupted");

    let mut events = indexer.start().await?;
    let second = collect_events(&mut events, 1, Duration::from_secs(5)).await?;
    wait_for_height(&indexer, 1, Duration::from_secs(5)).await?;
    let report = indexer.stop().await?;

    assert_eq!(
        second[0].receipt_id.as_str(),
        receipt_id(1, 1),
        "a receipt emitted before the restart must not be emitted again"
    );
    assert!(events.try_recv().is_none());
    assert_eq!(report.last_confirmed, Some(1));
    assert!(report.telemetry.duplicate_receipts >= 1);
    Ok(())
}
