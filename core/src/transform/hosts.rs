use serde::Deserialize;
use serde_json::{Map, Value};

use crate::errors::TransformError;
use crate::request::{
    DeleteResourceRequest, ReportResourceRequest, ReporterReference, RepresentationMetadata,
    ResourceReference, ResourceRepresentations,
};

pub const HOST_RESOURCE_TYPE: &str = "host";
pub const HOST_REPORTER_TYPE: &str = "hbi";
pub const HOST_REPORTER_INSTANCE_ID: &str = "redhat";
pub const HOST_API_HREF: &str = "https://apiHref.com/";
pub const HOST_CONSOLE_HREF: &str = "https://www.console.com/";
pub const HOST_REPORTER_VERSION: &str = "1.0";

/// Row of the hosts table as emitted by the change-capture connector.
#[derive(Debug, Default, Deserialize)]
struct HostPayload {
    #[serde(default)]
    id: String,
    #[serde(default)]
    satellite_id: Option<String>,
    #[serde(default)]
    subscription_manager_id: Option<String>,
    #[serde(default)]
    insights_id: Option<String>,
    #[serde(default)]
    ansible_host: Option<String>,
    /// Either an array of groups or that array serialized into a string.
    #[serde(default)]
    groups: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostGroup {
    pub id: String,
}

/// Normalizes the `groups` column. `null` yields no groups.
pub fn parse_groups(value: &Value) -> Result<Vec<HostGroup>, TransformError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => {
            Vec::<HostGroup>::deserialize(value).map_err(|e| TransformError::InvalidGroups {
                reason: e.to_string(),
            })
        }
        Value::String(raw) => {
            serde_json::from_str(raw).map_err(|e| TransformError::InvalidGroups {
                reason: format!("groups string is not valid JSON: {e}"),
            })
        }
        _ => Err(TransformError::InvalidGroups {
            reason: "groups field is not array or string".to_string(),
        }),
    }
}

/// Maps a host row into a report request.
///
/// A host without an id fails with [`TransformError::MissingResourceId`].
/// The workspace is taken from the first group membership; a host without
/// any membership fails with [`TransformError::MissingMembership`].
pub fn to_upsert_request(payload: &Value) -> Result<ReportResourceRequest, TransformError> {
    let host = HostPayload::deserialize(payload)?;
    if host.id.is_empty() {
        return Err(TransformError::MissingResourceId);
    }
    let groups = parse_groups(&host.groups)?;

    let workspace = groups
        .first()
        .ok_or_else(|| TransformError::MissingMembership {
            resource_id: host.id.clone(),
        })?;

    let mut common = Map::new();
    common.insert("workspace_id".to_string(), Value::String(workspace.id.clone()));

    let mut reporter = Map::new();
    for (field, value) in [
        ("satellite_id", host.satellite_id),
        ("sub_manager_id", host.subscription_manager_id),
        ("insights_inventory_id", host.insights_id),
        ("ansible_host", host.ansible_host),
    ] {
        reporter.insert(
            field.to_string(),
            value.map(Value::String).unwrap_or(Value::Null),
        );
    }

    Ok(ReportResourceRequest {
        inventory_id: None,
        resource_type: HOST_RESOURCE_TYPE.to_string(),
        reporter_type: HOST_REPORTER_TYPE.to_string(),
        reporter_instance_id: HOST_REPORTER_INSTANCE_ID.to_string(),
        representations: ResourceRepresentations {
            metadata: RepresentationMetadata {
                local_resource_id: host.id,
                api_href: HOST_API_HREF.to_string(),
                console_href: Some(HOST_CONSOLE_HREF.to_string()),
                reporter_version: Some(HOST_REPORTER_VERSION.to_string()),
            },
            common,
            reporter,
        },
    })
}

#[derive(Deserialize)]
struct KeyEnvelope {
    #[serde(default)]
    payload: KeyPayload,
}

#[derive(Default, Deserialize)]
struct KeyPayload {
    #[serde(default)]
    id: String,
}

/// Builds a host delete from a tombstone's key, `{"payload":{"id":...}}`.
pub fn to_delete_request(key: Option<&[u8]>) -> Result<DeleteResourceRequest, TransformError> {
    let key = match key {
        Some(key) if !key.is_empty() => key,
        _ => return Err(TransformError::MissingKey),
    };

    let envelope: KeyEnvelope =
        serde_json::from_slice(key).map_err(|e| TransformError::InvalidKey {
            reason: e.to_string(),
        })?;

    let resource_id = envelope.payload.id;
    if resource_id.is_empty() {
        return Err(TransformError::MissingResourceId);
    }

    Ok(DeleteResourceRequest {
        reference: ResourceReference {
            resource_type: HOST_RESOURCE_TYPE.to_string(),
            resource_id,
            reporter: Some(ReporterReference {
                reporter_type: HOST_REPORTER_TYPE.to_string(),
                instance_id: None,
            }),
        },
    })
}
