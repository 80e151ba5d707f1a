//! Routes a message with valid headers to the inventory service.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::envelope::{EventHeaders, Operation, decode_envelope};
use crate::errors::{ReplicatorError, RetryError, UpstreamError};
use crate::request::{DeleteResourceRequest, ReportResourceRequest, UpstreamRequest};
use crate::retry::{Classifier, RetryExecutor, RetryOutcome};
use crate::sink::InventoryClient;
use crate::source::RawEvent;
use crate::telemetry::ConsumerMetrics;
use crate::transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The inventory service no longer knows the resource.
    NotFound,
    /// The message can never be turned into a request.
    Unprocessable,
    UnknownOperation,
}

/// How a message was handled. Every variant means its offset may be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Replicated,
    Dropped(DropReason),
    /// Parsed and validated, but the client is disabled.
    Skipped,
}

pub struct MessageProcessor {
    client: Arc<dyn InventoryClient>,
    retry: RetryExecutor,
    metrics: ConsumerMetrics,
}

impl MessageProcessor {
    pub fn new(client: Arc<dyn InventoryClient>, retry: RetryExecutor, metrics: ConsumerMetrics) -> Self {
        Self {
            client,
            retry,
            metrics,
        }
    }

    /// Handles one message. An error means the inventory call exhausted its
    /// retries and the message must be redelivered.
    pub async fn process(&self, headers: &EventHeaders, event: &RawEvent) -> Result<Disposition, RetryError> {
        info!(
            operation = headers.operation_name(),
            version = headers.version().unwrap_or_default(),
            "processing message"
        );
        debug!(
            "processed message={}",
            String::from_utf8_lossy(event.value.as_deref().unwrap_or_default())
        );

        let route = match headers.operation() {
            Operation::Create | Operation::Update => Route {
                parse_stage: "ParseCreateOrUpdateMessage",
                call_site: "CreateResource",
                not_found_label: None,
                request: report_request(event).map(UpstreamRequest::Report),
            },
            Operation::Delete => Route {
                parse_stage: "ParseDeleteMessage",
                call_site: "DeleteResource",
                not_found_label: Some("InventoryResourceNotFound"),
                request: delete_request(event).map(UpstreamRequest::Delete),
            },
            Operation::Migration => migration_route(event),
            Operation::Unknown(raw) => {
                self.metrics.record_failure("unknown-operation-type", None);
                error!(
                    offset = event.offset,
                    operation = %raw,
                    version = headers.version().unwrap_or_default(),
                    "unknown operation type, message cannot be processed and will be dropped"
                );
                return Ok(Disposition::Dropped(DropReason::UnknownOperation));
            }
        };

        let request = match route.request {
            Ok(request) => request,
            Err(reason) => {
                self.metrics.record_failure(route.parse_stage, Some(reason.kind()));
                error!(stage = route.parse_stage, %reason, "message cannot be processed and will be dropped");
                return Ok(Disposition::Dropped(DropReason::Unprocessable));
            }
        };

        if !self.client.is_enabled() {
            debug!(resource_id = request.resource_id(), "inventory client disabled, skipping");
            return Ok(Disposition::Skipped);
        }

        match request {
            UpstreamRequest::Report(request) => self.report(request, route.call_site).await,
            UpstreamRequest::Delete(request) => {
                self.delete(request, route.call_site, route.not_found_label).await
            }
        }
    }

    async fn report(&self, request: ReportResourceRequest, call_site: &str) -> Result<Disposition, RetryError> {
        let client = &self.client;
        let request = &request;
        let outcome = self
            .retry
            .execute(call_site, move || client.create_or_update_resource(request.clone()), None)
            .await;
        self.finish(outcome, call_site)
    }

    async fn delete(
        &self,
        request: DeleteResourceRequest,
        call_site: &str,
        not_found_label: Option<&str>,
    ) -> Result<Disposition, RetryError> {
        let metrics = &self.metrics;
        let label = not_found_label.unwrap_or(call_site);
        let not_found = move |err: &UpstreamError| {
            if err.is_not_found() {
                metrics.record_failure(label, Some(err.kind()));
                warn!(error = %err, "inventory resource not found, dropping message");
                true
            } else {
                false
            }
        };

        let client = &self.client;
        let request = &request;
        let outcome = self
            .retry
            .execute(
                call_site,
                move || client.delete_resource(request.clone()),
                not_found_label.map(|_| &not_found as Classifier<'_>),
            )
            .await;
        self.finish(outcome, call_site)
    }

    fn finish<T: std::fmt::Debug>(
        &self,
        outcome: Result<RetryOutcome<T>, RetryError>,
        call_site: &str,
    ) -> Result<Disposition, RetryError> {
        match outcome {
            Ok(RetryOutcome::Completed(response)) => {
                debug!(?response, "response");
                Ok(Disposition::Replicated)
            }
            Ok(RetryOutcome::Dropped) => Ok(Disposition::Dropped(DropReason::NotFound)),
            Err(e) => {
                self.metrics.record_failure(call_site, Some(e.kind()));
                error!(call_site, error = %e, "failed to replicate resource");
                Err(e)
            }
        }
    }
}

/// Where a message goes and which labels its failures are counted under.
struct Route {
    parse_stage: &'static str,
    call_site: &'static str,
    not_found_label: Option<&'static str>,
    request: Result<UpstreamRequest, ReplicatorError>,
}

fn report_request(event: &RawEvent) -> Result<ReportResourceRequest, ReplicatorError> {
    let payload = decode_envelope(event.value.as_deref().unwrap_or_default())?;
    Ok(transform::decode_report_request(payload)?)
}

/// Tombstones carry their identity in the key; otherwise the payload is the request.
fn delete_request(event: &RawEvent) -> Result<DeleteResourceRequest, ReplicatorError> {
    if transform::is_tombstone(event.value.as_deref()) {
        return Ok(transform::to_delete_request(event.key.as_deref())?);
    }
    let payload = decode_envelope(event.value.as_deref().unwrap_or_default())?;
    Ok(transform::decode_delete_request(payload)?)
}

/// Migration events carry host records: a tombstone deletes the host, anything
/// else reports it.
fn migration_route(event: &RawEvent) -> Route {
    if transform::is_tombstone(event.value.as_deref()) {
        return Route {
            parse_stage: "TransformHostToDeleteResourceRequest",
            call_site: "ProcessMigrationResource",
            not_found_label: Some("MigrationResourceNotFound"),
            request: transform::to_delete_request(event.key.as_deref())
                .map(UpstreamRequest::Delete)
                .map_err(ReplicatorError::from),
        };
    }

    let request = decode_envelope(event.value.as_deref().unwrap_or_default())
        .map_err(ReplicatorError::from)
        .and_then(|payload| Ok(transform::to_upsert_request(&payload)?));
    Route {
        parse_stage: "TransformHostToReportResourceRequest",
        call_site: "ProcessMigrationResource",
        not_found_label: None,
        request: request.map(UpstreamRequest::Report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{HeaderSchema, parse_headers};
    use crate::request::{DeleteResourceResponse, ReportResourceResponse};
    use crate::retry::{RetryBound, RetryPolicy};
    use crate::sink::MockInventoryClient;
    use prometheus::Registry;
    use std::time::Duration;

    fn event(operation: &str, key: Option<&str>, value: Option<&str>) -> (EventHeaders, RawEvent) {
        let headers = vec![
            ("operation".to_string(), operation.as_bytes().to_vec()),
            ("version".to_string(), b"v1beta2".to_vec()),
        ];
        let parsed = parse_headers(&headers, HeaderSchema::Versioned).unwrap();
        let raw = RawEvent {
            key: key.map(|k| k.as_bytes().to_vec()),
            value: value.map(|v| v.as_bytes().to_vec()),
            headers,
            topic: "outbox.event.hbi.hosts".to_string(),
            partition: 0,
            offset: 7,
        };
        (parsed, raw)
    }

    fn processor(client: MockInventoryClient, attempts: u32) -> (MessageProcessor, ConsumerMetrics) {
        let metrics = ConsumerMetrics::new(&Registry::new()).unwrap();
        let policy = RetryPolicy {
            max_attempts: RetryBound::Limited(attempts),
            backoff_factor: 1,
            max_backoff: Duration::from_secs(1),
            base_unit: Duration::from_millis(300),
        };
        let retry = RetryExecutor::new(policy, metrics.clone());
        (
            MessageProcessor::new(Arc::new(client), retry, metrics.clone()),
            metrics,
        )
    }

    fn enabled_client() -> MockInventoryClient {
        let mut client = MockInventoryClient::new();
        client.expect_is_enabled().return_const(true);
        client
    }

    const REPORT_VALUE: &str = r#"{
        "schema": {"type": "string"},
        "payload": {
            "type": "host",
            "reporter_type": "hbi",
            "reporter_instance_id": "redhat",
            "representations": {
                "metadata": {"local_resource_id": "host-1", "api_href": "https://api/"},
                "common": {"workspace_id": "ws-1"},
                "reporter": {}
            }
        }
    }"#;

    const HOST_VALUE: &str = r#"{"payload": {"id": "host-1", "groups": [{"id": "ws-1"}]}}"#;

    fn not_found() -> UpstreamError {
        UpstreamError::NotFound {
            message: "resource not found".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_resource_is_replicated() {
        let mut client = enabled_client();
        client
            .expect_create_or_update_resource()
            .withf(|req| req.representations.metadata.local_resource_id == "host-1")
            .times(1)
            .returning(|_| Ok(ReportResourceResponse {}));
        let (processor, _) = processor(client, 3);

        let (headers, raw) = event("ReportResource", None, Some(REPORT_VALUE));
        assert_eq!(processor.process(&headers, &raw).await, Ok(Disposition::Replicated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_report_surfaces_an_error() {
        let mut client = enabled_client();
        client
            .expect_create_or_update_resource()
            .times(3)
            .returning(|_| {
                Err(UpstreamError::Transport {
                    reason: "connection refused".to_string(),
                })
            });
        let (processor, metrics) = processor(client, 3);

        let (headers, raw) = event("created", None, Some(REPORT_VALUE));
        let err = processor.process(&headers, &raw).await.unwrap_err();
        assert!(matches!(err, RetryError::MaxRetriesExceeded { attempts: 3, .. }));
        // three failed attempts plus the exhausted call
        assert_eq!(metrics.failure_count("CreateResource"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tombstone_delete_uses_key_and_drops_not_found() {
        let mut client = enabled_client();
        client
            .expect_delete_resource()
            .withf(|req| req.reference.resource_id == "abc-123")
            .times(1)
            .returning(|_| Err(not_found()));
        let (processor, metrics) = processor(client, 3);

        let (headers, raw) = event("DeleteResource", Some(r#"{"payload":{"id":"abc-123"}}"#), None);
        assert_eq!(
            processor.process(&headers, &raw).await,
            Ok(Disposition::Dropped(DropReason::NotFound))
        );
        assert_eq!(metrics.failure_count("InventoryResourceNotFound"), 1);
        assert_eq!(metrics.failure_count("DeleteResource"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_payload_is_replicated() {
        let mut client = enabled_client();
        client
            .expect_delete_resource()
            .withf(|req| req.reference.resource_id == "host-9" && req.reference.resource_type == "host")
            .times(1)
            .returning(|_| Ok(DeleteResourceResponse {}));
        let (processor, _) = processor(client, 3);

        let value = r#"{"payload": {"reference": {"resource_type": "host", "resource_id": "host-9"}}}"#;
        let (headers, raw) = event("deleted", None, Some(value));
        assert_eq!(processor.process(&headers, &raw).await, Ok(Disposition::Replicated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_migration_routes_by_tombstone() {
        let mut client = enabled_client();
        client
            .expect_create_or_update_resource()
            .withf(|req| req.representations.common["workspace_id"] == "ws-1")
            .times(1)
            .returning(|_| Ok(ReportResourceResponse {}));
        client
            .expect_delete_resource()
            .times(1)
            .returning(|_| Err(not_found()));
        let (processor, metrics) = processor(client, 3);

        let (headers, raw) = event("migration", None, Some(HOST_VALUE));
        assert_eq!(processor.process(&headers, &raw).await, Ok(Disposition::Replicated));

        let (headers, raw) = event("migration", Some(r#"{"payload":{"id":"host-1"}}"#), Some("null"));
        assert_eq!(
            processor.process(&headers, &raw).await,
            Ok(Disposition::Dropped(DropReason::NotFound))
        );
        assert_eq!(metrics.failure_count("MigrationResourceNotFound"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_without_groups_is_dropped_not_retried() {
        let client = enabled_client();
        let (processor, metrics) = processor(client, 3);

        let value = r#"{"payload": {"id": "host-1", "groups": []}}"#;
        let (headers, raw) = event("migration", None, Some(value));
        assert_eq!(
            processor.process(&headers, &raw).await,
            Ok(Disposition::Dropped(DropReason::Unprocessable))
        );
        assert_eq!(metrics.failure_count("TransformHostToReportResourceRequest"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_without_id_is_dropped_not_sent() {
        let mut client = enabled_client();
        client.expect_create_or_update_resource().never();
        let (processor, metrics) = processor(client, 3);

        let value = r#"{"payload": {"groups": [{"id": "ws-1"}]}}"#;
        let (headers, raw) = event("migration", None, Some(value));
        assert_eq!(
            processor.process(&headers, &raw).await,
            Ok(Disposition::Dropped(DropReason::Unprocessable))
        );
        assert_eq!(metrics.failure_count("TransformHostToReportResourceRequest"), 1);
        assert_eq!(metrics.failure_count("ProcessMigrationResource"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payloads_are_dropped() {
        let (processor, metrics) = processor(enabled_client(), 3);

        let (headers, raw) = event("ReportResource", None, Some("{not json"));
        assert_eq!(
            processor.process(&headers, &raw).await,
            Ok(Disposition::Dropped(DropReason::Unprocessable))
        );
        let (headers, raw) = event("DeleteResource", None, None);
        assert_eq!(
            processor.process(&headers, &raw).await,
            Ok(Disposition::Dropped(DropReason::Unprocessable))
        );
        assert_eq!(metrics.failure_count("ParseCreateOrUpdateMessage"), 1);
        assert_eq!(metrics.failure_count("ParseDeleteMessage"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_operation_is_dropped() {
        let (processor, metrics) = processor(MockInventoryClient::new(), 3);

        let (headers, raw) = event("archived", None, Some(REPORT_VALUE));
        assert_eq!(
            processor.process(&headers, &raw).await,
            Ok(Disposition::Dropped(DropReason::UnknownOperation))
        );
        assert_eq!(metrics.failure_count("unknown-operation-type"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_client_validates_but_skips() {
        let mut client = MockInventoryClient::new();
        client.expect_is_enabled().return_const(false);
        client.expect_create_or_update_resource().never();
        let (processor, _) = processor(client, 3);

        let (headers, raw) = event("ReportResource", None, Some(REPORT_VALUE));
        assert_eq!(processor.process(&headers, &raw).await, Ok(Disposition::Skipped));

        let (headers, raw) = event("ReportResource", None, Some("{not json"));
        assert_eq!(
            processor.process(&headers, &raw).await,
            Ok(Disposition::Dropped(DropReason::Unprocessable))
        );
    }
}
