//! Wire messages for the inventory gRPC API, declared by hand so no build
//! script is needed.

use prost_types::value::Kind;
use serde_json::{Map, Value};

use crate::request;

pub const REPORT_RESOURCE_PATH: &str = "/kessel.inventory.v1beta2.KesselInventoryService/ReportResource";
pub const DELETE_RESOURCE_PATH: &str = "/kessel.inventory.v1beta2.KesselInventoryService/DeleteResource";
pub const GET_LIVEZ_PATH: &str = "/kessel.inventory.v1.KesselInventoryHealthService/GetLivez";

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReportResourceRequest {
    #[prost(string, optional, tag = "1")]
    pub inventory_id: Option<String>,
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(string, tag = "3")]
    pub reporter_type: String,
    #[prost(string, tag = "4")]
    pub reporter_instance_id: String,
    #[prost(message, optional, tag = "5")]
    pub representations: Option<ResourceRepresentations>,
    #[prost(int32, tag = "6")]
    pub write_visibility: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ResourceRepresentations {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<RepresentationMetadata>,
    #[prost(message, optional, tag = "2")]
    pub common: Option<prost_types::Struct>,
    #[prost(message, optional, tag = "3")]
    pub reporter: Option<prost_types::Struct>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepresentationMetadata {
    #[prost(string, tag = "1")]
    pub local_resource_id: String,
    #[prost(string, tag = "2")]
    pub api_href: String,
    #[prost(string, optional, tag = "3")]
    pub console_href: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub reporter_version: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReportResourceResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteResourceRequest {
    #[prost(message, optional, tag = "1")]
    pub reference: Option<ResourceReference>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ResourceReference {
    #[prost(string, tag = "1")]
    pub resource_type: String,
    #[prost(string, tag = "2")]
    pub resource_id: String,
    #[prost(message, optional, tag = "3")]
    pub reporter: Option<ReporterReference>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReporterReference {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, optional, tag = "2")]
    pub instance_id: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteResourceResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetLivezRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetLivezResponse {
    #[prost(string, tag = "1")]
    pub status: String,
    #[prost(uint32, tag = "2")]
    pub code: u32,
}

impl From<request::ReportResourceRequest> for ReportResourceRequest {
    fn from(req: request::ReportResourceRequest) -> Self {
        let representations = req.representations;
        Self {
            inventory_id: req.inventory_id,
            r#type: req.resource_type,
            reporter_type: req.reporter_type,
            reporter_instance_id: req.reporter_instance_id,
            representations: Some(ResourceRepresentations {
                metadata: Some(RepresentationMetadata {
                    local_resource_id: representations.metadata.local_resource_id,
                    api_href: representations.metadata.api_href,
                    console_href: representations.metadata.console_href,
                    reporter_version: representations.metadata.reporter_version,
                }),
                common: Some(json_to_struct(representations.common)),
                reporter: Some(json_to_struct(representations.reporter)),
            }),
            write_visibility: 0,
        }
    }
}

impl From<request::DeleteResourceRequest> for DeleteResourceRequest {
    fn from(req: request::DeleteResourceRequest) -> Self {
        let reference = req.reference;
        Self {
            reference: Some(ResourceReference {
                resource_type: reference.resource_type,
                resource_id: reference.resource_id,
                reporter: reference.reporter.map(|reporter| ReporterReference {
                    r#type: reporter.reporter_type,
                    instance_id: reporter.instance_id,
                }),
            }),
        }
    }
}

pub fn json_to_struct(map: Map<String, Value>) -> prost_types::Struct {
    prost_types::Struct {
        fields: map
            .into_iter()
            .map(|(key, value)| (key, json_to_value(value)))
            .collect(),
    }
}

pub fn json_to_value(value: Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => Kind::NullValue(prost_types::NullValue::NullValue as i32),
        Value::Bool(b) => Kind::BoolValue(b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        Value::String(s) => Kind::StringValue(s),
        Value::Array(items) => Kind::ListValue(prost_types::ListValue {
            values: items.into_iter().map(json_to_value).collect(),
        }),
        Value::Object(map) => Kind::StructValue(json_to_struct(map)),
    };
    prost_types::Value { kind: Some(kind) }
}
