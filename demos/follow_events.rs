//! Follows a NEAR-style RPC endpoint and prints the NEP-297 events emitted by
//! one contract account until Ctrl-C.
//!
//! ```text
//! SHARDWATCH_RPC_URL=https://rpc.mainnet.near.org \
//! SHARDWATCH_ACCOUNT=app.near \
//! cargo run --example follow_events
//! ```

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use shardwatch::{
    EventLogDecoder, IndexerConfig, LedgerClient, NearRpcClient, ReceiverFilter, Runner,
};

const DEFAULT_RPC_URL: &str = "http://localhost:3030";
const DEFAULT_ACCOUNT: &str = "app.near";
const DEFAULT_CHUNK_WORKERS: usize = 8;
const DEFAULT_MAX_IN_FLIGHT: usize = 16;
const DEFAULT_POLL_MS: u64 = 500;
const DEFAULT_LOG_DIRECTIVE: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    shardwatch::init_tracing();

    let account = read_env_or_default("SHARDWATCH_ACCOUNT", DEFAULT_ACCOUNT);
    let mut builder = IndexerConfig::builder()
        .rpc_url(read_env_or_default("SHARDWATCH_RPC_URL", DEFAULT_RPC_URL))
        .chunk_workers(parse_env_with_default("SHARDWATCH_CHUNK_WORKERS", DEFAULT_CHUNK_WORKERS)?)
        .max_in_flight_blocks(parse_env_with_default(
            "SHARDWATCH_MAX_IN_FLIGHT",
            DEFAULT_MAX_IN_FLIGHT,
        )?)
        .polling_interval(Duration::from_millis(parse_env_with_default(
            "SHARDWATCH_POLL_MS",
            DEFAULT_POLL_MS,
        )?));
    if let Ok(key) = env::var("SHARDWATCH_API_KEY") {
        builder = builder.api_key(key);
    }
    if let Ok(height) = env::var("SHARDWATCH_START_AFTER") {
        let height = height
            .parse::<u64>()
            .with_context(|| format!("failed to parse SHARDWATCH_START_AFTER='{height}'"))?;
        builder = builder.start_after(height);
    }
    let config = builder.build()?;

    let ledger: Arc<dyn LedgerClient> = Arc::new(NearRpcClient::from_config(&config)?);
    let mut runner = Runner::new(config, ledger, ReceiverFilter::new(account), EventLogDecoder);

    let report = runner
        .run_until_ctrl_c(|indexed| async move {
            for event in &indexed.event.events {
                println!(
                    "{} {} {}/{} {}",
                    indexed.height,
                    indexed.receipt_id,
                    event.standard,
                    event.event,
                    event.data.as_ref().map(ToString::to_string).unwrap_or_default()
                );
            }
            Ok(())
        })
        .await?;

    println!(
        "stopped at height {:?}: {} blocks, {} events, {} ledger errors",
        report.last_confirmed,
        report.telemetry.blocks_completed,
        report.telemetry.events_emitted,
        report.telemetry.ledger_errors
    );
    Ok(())
}

fn read_env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}='{value}'")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}
