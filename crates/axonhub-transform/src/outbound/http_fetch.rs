//! Shared HTTP client for provider side-fetches (image downloads and the
//! like) that happen outside the main executor path. Clients are cached per
//! egress proxy so the side channel honors the same outbound routing as
//! every other upstream call.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::TransformError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

static FETCH_CLIENTS: OnceLock<Mutex<HashMap<Option<String>, wreq::Client>>> = OnceLock::new();

pub(crate) fn fetch_client(proxy: Option<&str>) -> Result<wreq::Client, TransformError> {
    let key = proxy
        .map(str::trim)
        .filter(|proxy| !proxy.is_empty())
        .map(str::to_string);
    let cache = FETCH_CLIENTS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut clients = cache
        .lock()
        .map_err(|_| TransformError::Other("fetch client cache lock failed".to_string()))?;
    if let Some(client) = clients.get(&key) {
        return Ok(client.clone());
    }

    let mut builder = wreq::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(FETCH_TIMEOUT);
    if let Some(proxy) = key.as_deref() {
        builder = builder
            .proxy(wreq::Proxy::all(proxy).map_err(|err| TransformError::Other(err.to_string()))?);
    }
    let client = builder
        .build()
        .map_err(|err| TransformError::Other(err.to_string()))?;
    clients.insert(key, client.clone());
    Ok(client)
}
