use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::{ConsumptionEngine, EngineExit, EngineSettings};
use crate::errors::SupervisorError;
use crate::processor::MessageProcessor;
use crate::retry::RetryPolicy;
use crate::source::ConsumerFactory;
use crate::telemetry::{ConsumerMetrics, StatsCollector};

/// Recreates the consumption engine after processing failures.
///
/// Each run gets a fresh broker connection, so consumption resumes from the
/// last committed offset and the failed message is delivered again.
pub struct Supervisor<F: ConsumerFactory> {
    factory: F,
    settings: EngineSettings,
    processor: Arc<MessageProcessor>,
    metrics: ConsumerMetrics,
    stats: Option<StatsCollector>,
    restart_policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<F: ConsumerFactory> Supervisor<F> {
    pub fn new(
        factory: F,
        settings: EngineSettings,
        processor: Arc<MessageProcessor>,
        metrics: ConsumerMetrics,
        restart_policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            factory,
            settings,
            processor,
            metrics,
            stats: None,
            restart_policy,
            cancel,
        }
    }

    pub fn with_stats(mut self, stats: StatsCollector) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Runs until shutdown is requested, a run fails fatally, or the restart
    /// budget is spent.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        let mut restarts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if !self.restart_policy.max_attempts.allows(restarts) {
                error!(restarts, "consumer retries exhausted, giving up");
                return Err(SupervisorError::RestartsExhausted { restarts });
            }

            let consumer = self
                .factory
                .create()
                .map_err(SupervisorError::ConsumerCreation)?;
            let mut engine = ConsumptionEngine::new(
                consumer,
                self.settings.clone(),
                self.processor.clone(),
                self.metrics.clone(),
                self.stats.clone(),
                self.cancel.clone(),
            );

            match engine.run().await? {
                EngineExit::Shutdown => {
                    info!("consumer shut down");
                    return Ok(());
                }
                EngineExit::ProcessingFailure => {
                    restarts = restarts.saturating_add(1);
                    if !self.restart_policy.max_attempts.allows(restarts) {
                        error!(restarts, "consumer retries exhausted, giving up");
                        return Err(SupervisorError::RestartsExhausted { restarts });
                    }

                    let backoff = self.restart_policy.backoff(restarts);
                    warn!(restarts, ?backoff, "consumer closed due to processing failure, restarting");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => {
                            info!("shutdown requested during restart backoff");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::HeaderSchema;
    use crate::errors::{BrokerError, EngineError, UpstreamError};
    use crate::retry::{RetryBound, RetryExecutor};
    use crate::sink::MockInventoryClient;
    use crate::source::{BrokerConsumer, ConsumerEvent, OffsetCommitter, OffsetRecord, RawEvent, RebalanceHandler};
    use parking_lot::Mutex;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Delivers the same single message forever, or a fatal error when asked.
    struct OneMessage {
        fatal: bool,
        delivered: bool,
    }

    impl OffsetCommitter for OneMessage {
        fn commit_offsets(&mut self, offsets: &[OffsetRecord]) -> Result<Vec<OffsetRecord>, BrokerError> {
            Ok(offsets.to_vec())
        }

        fn assignment_lost(&self) -> bool {
            false
        }
    }

    impl BrokerConsumer for OneMessage {
        fn subscribe(&mut self, _topics: &[String], _handler: Box<dyn RebalanceHandler>) -> Result<(), BrokerError> {
            Ok(())
        }

        fn poll(&mut self, _timeout: Duration) -> Option<ConsumerEvent> {
            if self.delivered {
                return None;
            }
            self.delivered = true;
            if self.fatal {
                return Some(ConsumerEvent::Error {
                    code: "Fatal".to_string(),
                    message: "fenced".to_string(),
                    fatal: true,
                });
            }
            Some(ConsumerEvent::Message(RawEvent {
                key: None,
                value: Some(br#"{"payload": {"id": "host-1", "groups": [{"id": "ws-1"}]}}"#.to_vec()),
                headers: vec![
                    ("operation".to_string(), b"migration".to_vec()),
                    ("version".to_string(), b"v1beta2".to_vec()),
                ],
                topic: "hosts".to_string(),
                partition: 0,
                offset: 4,
            }))
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn close(&mut self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn failing_client() -> MockInventoryClient {
        let mut client = MockInventoryClient::new();
        client.expect_is_enabled().return_const(true);
        client.expect_create_or_update_resource().returning(|_| {
            Err(UpstreamError::Transport {
                reason: "connection refused".to_string(),
            })
        });
        client
    }

    fn supervisor<F: ConsumerFactory>(
        factory: F,
        client: MockInventoryClient,
        restarts: RetryBound,
        cancel: CancellationToken,
    ) -> Supervisor<F> {
        let metrics = ConsumerMetrics::new(&Registry::new()).unwrap();
        let policy = RetryPolicy {
            max_attempts: RetryBound::Limited(1),
            backoff_factor: 1,
            max_backoff: Duration::from_secs(1),
            base_unit: Duration::from_millis(300),
        };
        let processor = MessageProcessor::new(
            Arc::new(client),
            RetryExecutor::new(policy, metrics.clone()),
            metrics.clone(),
        );
        let settings = EngineSettings {
            topics: vec!["hosts".to_string()],
            header_schema: HeaderSchema::Versioned,
            poll_timeout: Duration::from_millis(100),
            commit_modulo: 10,
        };
        let restart_policy = RetryPolicy {
            max_attempts: restarts,
            backoff_factor: 5,
            max_backoff: Duration::from_secs(30),
            base_unit: Duration::from_millis(300),
        };
        Supervisor::new(factory, settings, Arc::new(processor), metrics, restart_policy, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_until_budget_is_spent() {
        let created = Arc::new(AtomicU32::new(0));
        let counter = created.clone();
        let factory = move || -> Result<Box<dyn BrokerConsumer>, BrokerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(OneMessage {
                fatal: false,
                delivered: false,
            }))
        };
        let supervisor = supervisor(factory, failing_client(), RetryBound::Limited(3), CancellationToken::new());

        let start = tokio::time::Instant::now();
        let err = supervisor.run().await.unwrap_err();
        assert!(matches!(err, SupervisorError::RestartsExhausted { restarts: 3 }));
        assert_eq!(created.load(Ordering::SeqCst), 3);
        // 1.5s + 3s of backoff; none after the last run
        assert_eq!(start.elapsed(), Duration::from_millis(4500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_restart_backoff_is_not_delayed() {
        let created = Arc::new(AtomicU32::new(0));
        let counter = created.clone();
        let factory = move || -> Result<Box<dyn BrokerConsumer>, BrokerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(OneMessage {
                fatal: false,
                delivered: false,
            }))
        };
        let cancel = CancellationToken::new();
        let supervisor = supervisor(factory, failing_client(), RetryBound::Unbounded, cancel.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let start = tokio::time::Instant::now();
        assert!(supervisor.run().await.is_ok());
        // first backoff is 1.5s, shutdown arrives after 1s
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_broker_error_is_not_restarted() {
        let created = Arc::new(AtomicU32::new(0));
        let counter = created.clone();
        let factory = move || -> Result<Box<dyn BrokerConsumer>, BrokerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(OneMessage {
                fatal: true,
                delivered: false,
            }))
        };
        let supervisor = supervisor(factory, failing_client(), RetryBound::Unbounded, CancellationToken::new());

        let err = supervisor.run().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Engine(EngineError::BrokerFatal { .. })));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_request_ends_cleanly() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut client = MockInventoryClient::new();
        client.expect_is_enabled().return_const(true);
        client.expect_create_or_update_resource().returning(move |_| {
            token.cancel();
            Ok(crate::request::ReportResourceResponse {})
        });
        let factory = || -> Result<Box<dyn BrokerConsumer>, BrokerError> {
            Ok(Box::new(OneMessage {
                fatal: false,
                delivered: false,
            }))
        };
        let supervisor = supervisor(factory, client, RetryBound::Limited(1), cancel);

        assert!(supervisor.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_consumer_creation_failure_is_propagated() {
        let factory = || -> Result<Box<dyn BrokerConsumer>, BrokerError> {
            Err(BrokerError::ConsumerCreation {
                reason: "no brokers".to_string(),
            })
        };
        let supervisor = supervisor(factory, failing_client(), RetryBound::Limited(3), CancellationToken::new());

        let err = supervisor.run().await.unwrap_err();
        assert!(matches!(err, SupervisorError::ConsumerCreation(_)));
    }
}
