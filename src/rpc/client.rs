//! `LedgerClient` over a NEAR-style JSON-RPC endpoint, built on the
//! `jsonrpsee` HTTP client.

use crate::ledger::{
    Block, BlockHeader, BlockHeight, Chunk, ChunkReference, LedgerClient, LedgerError,
    LedgerErrorKind, LedgerFuture, Outcome, OutcomeRequest,
};
use crate::rpc::auth::build_auth_headers;
use crate::rpc::options::RpcClientOptions;
use crate::rpc::views::{BlockView, ChunkView, LightClientProofView};
use crate::runtime::config::IndexerConfig;
use anyhow::{anyhow, Result};
use jsonrpsee::core::{
    client::{ClientT, Error as JsonRpcError},
    http_helpers::HttpError,
    params::ObjectParams,
};
use jsonrpsee::http_client::transport::Error as HttpTransportError;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::types::ErrorObjectOwned;
use serde::Serialize;

const NOT_FOUND_MARKERS: &[&str] = &[
    "unknown_block",
    "unknown block",
    "unknown_chunk",
    "unknown chunk",
    "chunk missing",
    "unknown_receipt",
    "unknown receipt",
    "db not found",
];
const AHEAD_OF_HEAD: &str = "is ahead of head block";

/// Ledger adapter speaking the `block`, `chunk` and
/// `EXPERIMENTAL_light_client_proof` methods.
#[derive(Debug, Clone)]
pub struct NearRpcClient {
    client: HttpClient,
    options: RpcClientOptions,
}

impl NearRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_options(url, RpcClientOptions::default())
    }

    pub fn with_options(url: impl Into<String>, options: RpcClientOptions) -> Result<Self> {
        options.validate()?;

        let rpc_url: String = url.into();
        let headers = build_auth_headers(options.api_key.as_deref())?;
        let max_request_body_size = options.max_request_body_bytes.min(u32::MAX as usize) as u32;
        let max_response_body_size = options.max_response_body_bytes.min(u32::MAX as usize) as u32;

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(options.request_timeout)
            .max_concurrent_requests(options.max_concurrent_requests)
            .max_request_size(max_request_body_size)
            .max_response_size(max_response_body_size)
            .build(&rpc_url)
            .map_err(|err| anyhow!("failed to build RPC client: {err}"))?;

        Ok(Self { client, options })
    }

    pub fn from_config(config: &IndexerConfig) -> Result<Self> {
        config.validate()?;
        let options = RpcClientOptions {
            max_concurrent_requests: std::cmp::max(32, config.chunk_workers().saturating_mul(4)),
            request_timeout: config.rpc_timeout(),
            api_key: config.api_key().map(str::to_owned),
            ..RpcClientOptions::default()
        };
        Self::with_options(config.rpc_url().to_owned(), options)
    }

    async fn call<R>(
        &self,
        operation: &'static str,
        method: &str,
        params: ObjectParams,
    ) -> Result<R, LedgerError>
    where
        R: serde::de::DeserializeOwned,
    {
        self.client
            .request(method, params)
            .await
            .map_err(|err| map_rpc_error(operation, err))
    }

    async fn latest_block(&self) -> Result<BlockHeader, LedgerError> {
        let params = object_params("latest block", [("finality", "final")])?;
        let view: BlockView = self.call("latest block", "block", params).await?;
        Ok(view.header())
    }

    async fn block_at(&self, height: BlockHeight) -> Result<Option<Block>, LedgerError> {
        let params = object_params("block", [("block_id", height)])?;
        match self.call::<BlockView>("block", "block", params).await {
            Ok(view) => Ok(Some(view.into_block())),
            Err(err) if err.kind() == LedgerErrorKind::NotFound => {
                tracing::debug!(height, error = %err, "node reports no block at height");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn chunk(&self, reference: &ChunkReference) -> Result<Chunk, LedgerError> {
        let params = object_params("chunk", [("chunk_id", reference.chunk_id.as_str())])?;
        let view: ChunkView = self.call("chunk", "chunk", params).await?;
        Ok(view.into())
    }

    /// Looks the outcome up relative to `request.block_id`, moving the head to
    /// the block the node names when it reports the head as too recent.
    async fn outcome(&self, request: &OutcomeRequest) -> Result<Outcome, LedgerError> {
        const OPERATION: &str = "receipt outcome";
        const METHOD: &str = "EXPERIMENTAL_light_client_proof";

        let mut head = request.block_id.as_str().to_owned();
        let mut hops = 0;
        loop {
            let params = object_params(
                OPERATION,
                [
                    ("type", "receipt"),
                    ("receipt_id", request.receipt_id.as_str()),
                    ("receiver_id", request.receiver_id.as_str()),
                    ("light_client_head", head.as_str()),
                ],
            )?;

            let err = match self.client.request::<LightClientProofView, _>(METHOD, params).await {
                Ok(view) => {
                    let outcome = Outcome::from(view.outcome_proof);
                    if outcome.receipt_id != request.receipt_id {
                        return Err(LedgerError::fatal(
                            OPERATION,
                            format!(
                                "requested outcome of {} but node returned {}",
                                request.receipt_id, outcome.receipt_id
                            ),
                        ));
                    }
                    return Ok(outcome);
                }
                Err(err) => err,
            };

            let next_head = match &err {
                JsonRpcError::Call(call) => ahead_of_head_hint(&call_error_text(call)),
                _ => None,
            };
            match next_head {
                Some(next) if hops < self.options.max_head_hops => {
                    hops += 1;
                    tracing::debug!(
                        receipt = %request.receipt_id,
                        head = %next,
                        hops,
                        "light client head ahead of node; retrying with suggested head"
                    );
                    head = next;
                }
                Some(_) => {
                    return Err(LedgerError::transient(
                        OPERATION,
                        format!("light client head still ahead of node after {hops} hops"),
                    ));
                }
                None => return Err(map_rpc_error(OPERATION, err)),
            }
        }
    }
}

impl LedgerClient for NearRpcClient {
    fn get_latest_block(&self) -> LedgerFuture<'_, BlockHeader> {
        Box::pin(self.latest_block())
    }

    fn get_block(&self, height: BlockHeight) -> LedgerFuture<'_, Option<Block>> {
        Box::pin(self.block_at(height))
    }

    fn get_chunk<'a>(&'a self, reference: &'a ChunkReference) -> LedgerFuture<'a, Chunk> {
        Box::pin(self.chunk(reference))
    }

    fn get_receipt_outcome<'a>(&'a self, request: &'a OutcomeRequest) -> LedgerFuture<'a, Outcome> {
        Box::pin(self.outcome(request))
    }
}

fn object_params<V, const N: usize>(
    operation: &'static str,
    entries: [(&str, V); N],
) -> Result<ObjectParams, LedgerError>
where
    V: Serialize,
{
    let mut params = ObjectParams::new();
    for (name, value) in entries {
        params.insert(name, value).map_err(|err| {
            LedgerError::fatal(operation, format!("failed to serialize {name}: {err}"))
        })?;
    }
    Ok(params)
}

fn map_rpc_error(operation: &'static str, err: JsonRpcError) -> LedgerError {
    match err {
        JsonRpcError::Call(call) => classify_call_error(operation, &call),
        JsonRpcError::RequestTimeout => LedgerError::timeout(operation),
        JsonRpcError::ParseError(parse) => {
            LedgerError::fatal(operation, format!("malformed response: {parse}"))
        }
        err if response_too_large(&err) => {
            LedgerError::fatal(operation, format!("response exceeded HTTP size limits: {err}"))
        }
        JsonRpcError::Transport(transport) => {
            LedgerError::transient(operation, format!("transport error: {transport}"))
        }
        other => LedgerError::transient(operation, other.to_string()),
    }
}

fn classify_call_error(operation: &'static str, call: &ErrorObjectOwned) -> LedgerError {
    let text = call_error_text(call);
    let lowered = text.to_ascii_lowercase();
    let message = format!("rpc error (code={}): {text}", call.code());

    if NOT_FOUND_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return LedgerError::not_found(operation, message);
    }
    match call.code() {
        // Parse error, invalid request, unknown method, invalid params.
        -32700 | -32600 | -32601 | -32602 => LedgerError::fatal(operation, message),
        _ if lowered.contains("timeout") => {
            LedgerError::new(LedgerErrorKind::Timeout, operation, message)
        }
        _ => LedgerError::transient(operation, message),
    }
}

fn call_error_text(call: &ErrorObjectOwned) -> String {
    match call.data() {
        Some(data) => format!("{} {}", call.message(), data.get()),
        None => call.message().to_owned(),
    }
}

/// Extracts `<hash>` from "... block <hash> is ahead of head block ...".
fn ahead_of_head_hint(text: &str) -> Option<String> {
    let position = text.find(AHEAD_OF_HEAD)?;
    let before = &text[..position];
    let start = before.rfind("block ")? + "block ".len();
    let hash = before[start..]
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_ascii_alphanumeric());
    (!hash.is_empty()).then(|| hash.to_owned())
}

fn response_too_large(err: &JsonRpcError) -> bool {
    match err {
        JsonRpcError::Transport(inner) => {
            if let Some(transport_err) = inner.downcast_ref::<HttpTransportError>() {
                match transport_err {
                    HttpTransportError::Http(http_err) => matches!(http_err, HttpError::TooLarge),
                    HttpTransportError::RequestTooLarge => true,
                    _ => false,
                }
            } else {
                false
            }
        }
        _ => false,
    }
}
