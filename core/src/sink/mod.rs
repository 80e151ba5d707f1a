pub mod auth;
pub mod inventory;
pub mod proto;

use async_trait::async_trait;

use crate::errors::UpstreamError;
use crate::request::{
    DeleteResourceRequest, DeleteResourceResponse, ReportResourceRequest, ReportResourceResponse,
};

pub use inventory::{GrpcInventoryClient, check_readiness};

/// The inventory service as seen by the consumer.
///
/// A disabled client is a standby mode: messages are still parsed and
/// validated but nothing is replicated.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InventoryClient: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn create_or_update_resource(
        &self,
        request: ReportResourceRequest,
    ) -> Result<ReportResourceResponse, UpstreamError>;

    async fn delete_resource(
        &self,
        request: DeleteResourceRequest,
    ) -> Result<DeleteResourceResponse, UpstreamError>;
}
