//! Decoding of the change-event envelope: the required headers and the
//! `{"schema": ..., "payload": ...}` document carried in the message value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EnvelopeError;

pub const OPERATION_HEADER: &str = "operation";
pub const VERSION_HEADER: &str = "version";

pub const SUPPORTED_API_VERSIONS: &[&str] = &["v1beta2"];

/// Which header contract the producing outbox follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderSchema {
    /// `operation` only, with `created|updated|deleted|migration` values.
    Legacy,
    /// `operation` and `version`, with API operation names.
    #[default]
    Versioned,
}

impl HeaderSchema {
    pub fn required_headers(&self) -> &'static [&'static str] {
        match self {
            HeaderSchema::Legacy => &[OPERATION_HEADER],
            HeaderSchema::Versioned => &[OPERATION_HEADER, VERSION_HEADER],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create,
    /// Also covers `ReportResource`, which creates or updates.
    Update,
    Delete,
    Migration,
    Unknown(String),
}

impl Operation {
    pub fn from_header(value: &str) -> Self {
        match value {
            "created" => Operation::Create,
            "updated" | "ReportResource" => Operation::Update,
            "deleted" | "DeleteResource" => Operation::Delete,
            "migration" => Operation::Migration,
            other => Operation::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
            Operation::Migration => write!(f, "migration"),
            Operation::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}

/// The required headers of one event, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeaders {
    values: BTreeMap<String, String>,
}

impl EventHeaders {
    /// Raw `operation` header value, used to tag metrics.
    pub fn operation_name(&self) -> &str {
        self.values
            .get(OPERATION_HEADER)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn operation(&self) -> Operation {
        Operation::from_header(self.operation_name())
    }

    pub fn version(&self) -> Option<&str> {
        self.values.get(VERSION_HEADER).map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Extracts the headers required by `schema`, ignoring any others.
///
/// Fails when a required header is absent or has an empty value, and for the
/// versioned schema when the version is not one this consumer understands.
pub fn parse_headers(
    headers: &[(String, Vec<u8>)],
    schema: HeaderSchema,
) -> Result<EventHeaders, EnvelopeError> {
    let required = schema.required_headers();

    let mut values = BTreeMap::new();
    for (name, value) in headers {
        if required.contains(&name.as_str()) {
            values.insert(name.clone(), String::from_utf8_lossy(value).into_owned());
        }
    }

    let complete = required
        .iter()
        .all(|name| values.get(*name).is_some_and(|v| !v.is_empty()));
    if !complete {
        return Err(EnvelopeError::MissingHeaders {
            found: format!("{values:?}"),
        });
    }

    if let Some(version) = values.get(VERSION_HEADER) {
        if !SUPPORTED_API_VERSIONS.contains(&version.as_str()) {
            return Err(EnvelopeError::UnsupportedVersion {
                version: version.clone(),
            });
        }
    }

    Ok(EventHeaders { values })
}

#[derive(Deserialize)]
struct Envelope {
    // `schema` is left undeclared and ignored.
    #[serde(default)]
    payload: Option<Value>,
}

/// Returns the `payload` of a change-event envelope.
pub fn decode_envelope(value: &[u8]) -> Result<Value, EnvelopeError> {
    let envelope: Envelope =
        serde_json::from_slice(value).map_err(|e| EnvelopeError::InvalidEnvelope {
            reason: e.to_string(),
        })?;

    match envelope.payload {
        Some(Value::Null) | None => Err(EnvelopeError::MissingPayload),
        Some(payload) => Ok(payload),
    }
}
