//! Turns decoded change-event payloads into inventory requests.

pub mod hosts;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::TransformError;
use crate::request::{DeleteResourceRequest, ReportResourceRequest};

pub use hosts::{to_delete_request, to_upsert_request};

/// True when a record value carries no document: empty, whitespace, or a JSON `null`.
pub fn is_tombstone(value: Option<&[u8]>) -> bool {
    let Some(value) = value else {
        return true;
    };
    let trimmed = String::from_utf8_lossy(value);
    let trimmed = trimmed.trim();
    trimmed.is_empty() || trimmed == "null"
}

/// Reads an envelope payload that is already shaped as a report request.
pub fn decode_report_request(payload: Value) -> Result<ReportResourceRequest, TransformError> {
    decode_request(payload)
}

/// Reads an envelope payload that is already shaped as a delete request.
pub fn decode_delete_request(payload: Value) -> Result<DeleteResourceRequest, TransformError> {
    decode_request(payload)
}

fn decode_request<T: DeserializeOwned>(payload: Value) -> Result<T, TransformError> {
    serde_json::from_value(payload).map_err(|e| TransformError::InvalidPayload {
        reason: e.to_string(),
    })
}
