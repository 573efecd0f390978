//! Pack fetching: store hit, else HTTP or the local filesystem, with a
//! best-effort write-back into the store.

use bytes::Bytes;

use crate::store::PackStore;
use crate::{Pack, PackError, PackResult};

/// Fetch the raw pack bytes for `url`.
///
/// `http://`/`https://` URLs go over the network; a `file://` URL or a
/// plain path reads from disk.
pub fn fetch_pack(url: &str, store: &dyn PackStore) -> PackResult<Bytes> {
    if let Some(bytes) = store.get(url) {
        return Ok(bytes);
    }

    let bytes = if url.starts_with("http://") || url.starts_with("https://") {
        fetch_http(url)?
    } else {
        let path = url.strip_prefix("file://").unwrap_or(url);
        Bytes::from(std::fs::read(path)?)
    };

    store.put(url, &bytes);
    Ok(bytes)
}

fn fetch_http(url: &str) -> PackResult<Bytes> {
    tracing::debug!(url, "fetching pack");
    let response = reqwest::blocking::get(url)
        .map_err(|e| PackError::Network(format!("GET {url}: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(PackError::Network(format!("GET {url}: HTTP {status}")));
    }
    let bytes = response
        .bytes()
        .map_err(|e| PackError::Network(format!("reading body of {url}: {e}")))?;
    tracing::debug!(url, len = bytes.len(), "pack fetched");
    Ok(bytes)
}

/// Fetch and parse in one step.
pub fn load_pack(url: &str, store: &dyn PackStore) -> PackResult<Pack> {
    let bytes = fetch_pack(url, store)?;
    Pack::parse(bytes)
}
