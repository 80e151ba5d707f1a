use std::time::Duration;

use async_trait::async_trait;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

use crate::config::ClientOptions;
use crate::errors::UpstreamError;
use crate::request::{
    DeleteResourceRequest, DeleteResourceResponse, ReportResourceRequest, ReportResourceResponse,
};
use crate::sink::InventoryClient;
use crate::sink::auth::TokenSource;
use crate::sink::proto;

fn transport_error(e: impl std::fmt::Display) -> UpstreamError {
    UpstreamError::Transport {
        reason: e.to_string(),
    }
}

/// Adds a scheme when the configured url is a bare `host:port`.
fn endpoint_uri(options: &ClientOptions) -> String {
    if options.url.contains("://") {
        options.url.clone()
    } else if options.insecure {
        format!("http://{}", options.url)
    } else {
        format!("https://{}", options.url)
    }
}

/// TLS settings for the inventory channel, trusting the platform's root certificates.
fn tls_config() -> ClientTlsConfig {
    ClientTlsConfig::new().with_native_roots()
}

/// Builds a lazily connecting channel; nothing touches the network until the first call.
pub fn build_channel(options: &ClientOptions) -> Result<Channel, UpstreamError> {
    let mut endpoint = Endpoint::from_shared(endpoint_uri(options))
        .map_err(transport_error)?
        .timeout(Duration::from_secs(options.request_timeout_secs));

    if !options.insecure {
        endpoint = endpoint
            .tls_config(tls_config())
            .map_err(transport_error)?;
    }

    Ok(endpoint.connect_lazy())
}

/// [`InventoryClient`] over the inventory gRPC API.
pub struct GrpcInventoryClient {
    channel: Option<Channel>,
    tokens: Option<TokenSource>,
}

impl GrpcInventoryClient {
    pub fn new(options: &ClientOptions) -> Result<Self, UpstreamError> {
        if !options.enabled {
            info!("inventory client disabled, messages will not be replicated");
            return Ok(Self {
                channel: None,
                tokens: None,
            });
        }

        let tokens = if options.enable_oidc_auth {
            Some(TokenSource::new(
                options.token_endpoint.clone().unwrap_or_default(),
                options.client_id.clone().unwrap_or_default(),
                options.client_secret.clone().unwrap_or_default(),
            ))
        } else {
            None
        };

        Ok(Self {
            channel: Some(build_channel(options)?),
            tokens,
        })
    }

    async fn unary<Req, Resp>(&self, path: &'static str, message: Req) -> Result<Resp, UpstreamError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let channel = self.channel.clone().ok_or(UpstreamError::Disabled)?;

        let mut request = tonic::Request::new(message);
        if let Some(tokens) = &self.tokens {
            let token = tokens.token().await?;
            let value = AsciiMetadataValue::try_from(format!("Bearer {token}")).map_err(|e| {
                UpstreamError::Auth {
                    reason: e.to_string(),
                }
            })?;
            request.metadata_mut().insert("authorization", value);
        }

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await.map_err(transport_error)?;
        let response = grpc
            .unary(
                request,
                PathAndQuery::from_static(path),
                ProstCodec::<Req, Resp>::default(),
            )
            .await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl InventoryClient for GrpcInventoryClient {
    fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    async fn create_or_update_resource(
        &self,
        request: ReportResourceRequest,
    ) -> Result<ReportResourceResponse, UpstreamError> {
        debug!(resource_id = %request.representations.metadata.local_resource_id, "reporting resource");
        let _: proto::ReportResourceResponse = self
            .unary(proto::REPORT_RESOURCE_PATH, proto::ReportResourceRequest::from(request))
            .await?;
        Ok(ReportResourceResponse {})
    }

    async fn delete_resource(
        &self,
        request: DeleteResourceRequest,
    ) -> Result<DeleteResourceResponse, UpstreamError> {
        debug!(resource_id = %request.reference.resource_id, "deleting resource");
        let _: proto::DeleteResourceResponse = self
            .unary(proto::DELETE_RESOURCE_PATH, proto::DeleteResourceRequest::from(request))
            .await?;
        Ok(DeleteResourceResponse {})
    }
}

/// Calls the inventory liveness endpoint; healthy when it answers with a 2xx code.
pub async fn check_readiness(options: &ClientOptions) -> Result<String, UpstreamError> {
    let mut grpc = tonic::client::Grpc::new(build_channel(options)?);
    grpc.ready().await.map_err(transport_error)?;

    let response: proto::GetLivezResponse = grpc
        .unary(
            tonic::Request::new(proto::GetLivezRequest {}),
            PathAndQuery::from_static(proto::GET_LIVEZ_PATH),
            ProstCodec::<proto::GetLivezRequest, proto::GetLivezResponse>::default(),
        )
        .await?
        .into_inner();

    if (200..300).contains(&response.code) {
        Ok(response.status)
    } else {
        Err(UpstreamError::Rpc {
            code: response.code.to_string(),
            message: response.status,
        })
    }
}
