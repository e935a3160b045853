//! API key header wiring for hosted JSON-RPC providers.

use anyhow::{Context, Result};
use jsonrpsee::http_client::{HeaderMap, HeaderValue};

pub(crate) const API_KEY_HEADER: &str = "x-api-key";

pub(crate) fn build_auth_headers(api_key: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key {
        let mut value =
            HeaderValue::from_str(key).context("failed to build x-api-key header")?;
        value.set_sensitive(true);
        headers.insert(API_KEY_HEADER, value);
    }
    Ok(headers)
}
