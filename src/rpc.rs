//! JSON-RPC ledger adapter: client, API key wiring, options and the wire
//! views it decodes.

pub mod auth;
pub mod client;
pub mod options;
pub(crate) mod views;

pub use client::NearRpcClient;
pub use options::RpcClientOptions;
