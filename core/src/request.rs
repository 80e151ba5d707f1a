//! Request shapes sent to the inventory service.
//!
//! Field names follow the snake_case JSON form of the inventory API so that
//! request-shaped payloads decode directly into these types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ReportResourceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_id: Option<String>,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub reporter_type: String,
    pub reporter_instance_id: String,
    #[serde(default)]
    pub representations: ResourceRepresentations,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ResourceRepresentations {
    #[serde(default)]
    pub metadata: RepresentationMetadata,
    #[serde(default)]
    pub common: Map<String, Value>,
    #[serde(default)]
    pub reporter: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RepresentationMetadata {
    #[serde(default)]
    pub local_resource_id: String,
    #[serde(default)]
    pub api_href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeleteResourceRequest {
    pub reference: ResourceReference,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResourceReference {
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<ReporterReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReporterReference {
    #[serde(rename = "type")]
    pub reporter_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportResourceResponse {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResourceResponse {}

/// A change ready to be replicated.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamRequest {
    Report(ReportResourceRequest),
    Delete(DeleteResourceRequest),
}

impl UpstreamRequest {
    /// Identifier used in logs.
    pub fn resource_id(&self) -> &str {
        match self {
            UpstreamRequest::Report(req) => &req.representations.metadata.local_resource_id,
            UpstreamRequest::Delete(req) => &req.reference.resource_id,
        }
    }
}
