//! HTTP handlers, grouped by resource.

pub mod events;
pub mod instances;
pub mod operations;

use axum::body::Bytes;
use serde::de::DeserializeOwned;

use lxd_shim_core::Error;

/// Parse an optional JSON body; an empty body yields the default value.
pub(crate) fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| Error::InvalidInput(format!("invalid request body: {e}")))
}
