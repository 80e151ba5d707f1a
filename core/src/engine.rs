//! The poll loop of a single consumer instance.
//!
//! One event is fully handled before the next poll, so an offset only reaches
//! the ledger once its message has been replicated or dropped on purpose.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ConsumerOptions;
use crate::envelope::{HeaderSchema, parse_headers};
use crate::errors::EngineError;
use crate::ledger::{LedgerRebalanceHandler, OffsetLedger, SharedLedger};
use crate::processor::MessageProcessor;
use crate::source::{BrokerConsumer, ConsumerEvent, RawEvent};
use crate::telemetry::{ConsumerMetrics, StatsCollector, StatsData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    ShuttingDown,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Closed,
    /// Shutdown had already completed.
    AlreadyClosed,
}

/// Why a run ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// A message could not be handled; the consumer must be recreated so it
    /// is read again from the last committed offset.
    ProcessingFailure,
    /// Cancellation was requested.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub topics: Vec<String>,
    pub header_schema: HeaderSchema,
    pub poll_timeout: Duration,
    pub commit_modulo: i64,
}

impl EngineSettings {
    pub fn from_options(options: &ConsumerOptions) -> Self {
        Self {
            topics: options.topics.clone(),
            header_schema: options.header_schema,
            poll_timeout: Duration::from_millis(options.poll_timeout_ms),
            commit_modulo: options.commit_modulo,
        }
    }
}

enum Step {
    Continue,
    Exit(EngineExit),
}

pub struct ConsumptionEngine {
    consumer: Box<dyn BrokerConsumer>,
    settings: EngineSettings,
    ledger: SharedLedger,
    processor: Arc<MessageProcessor>,
    metrics: ConsumerMetrics,
    stats: Option<StatsCollector>,
    state: LifecycleState,
    cancel: CancellationToken,
}

impl ConsumptionEngine {
    pub fn new(
        consumer: Box<dyn BrokerConsumer>,
        settings: EngineSettings,
        processor: Arc<MessageProcessor>,
        metrics: ConsumerMetrics,
        stats: Option<StatsCollector>,
        cancel: CancellationToken,
    ) -> Self {
        let ledger = OffsetLedger::shared(settings.commit_modulo);
        Self {
            consumer,
            settings,
            ledger,
            processor,
            metrics,
            stats,
            state: LifecycleState::Running,
            cancel,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    /// Subscribes and consumes until cancelled, a message fails, or the broker
    /// reports a fatal error. The consumer is always shut down before returning.
    pub async fn run(&mut self) -> Result<EngineExit, EngineError> {
        let handler = Box::new(LedgerRebalanceHandler::new(self.ledger.clone()));
        if let Err(e) = self.consumer.subscribe(&self.settings.topics, handler) {
            self.metrics.record_consumer_error("SubscribeTopics", e.kind());
            error!(error = %e, "failed to subscribe to topics");
            self.shutdown()?;
            return Err(EngineError::Subscribe(e));
        }
        info!(topics = ?self.settings.topics, "consumer subscribed");

        let result = self.consume().await;
        self.state = LifecycleState::ShuttingDown;
        self.shutdown()?;
        result
    }

    async fn consume(&mut self) -> Result<EngineExit, EngineError> {
        loop {
            if self.cancel.is_cancelled() {
                info!("shutdown requested, stopping consumer");
                return Ok(EngineExit::Shutdown);
            }

            let Some(event) = self.consumer.poll(self.settings.poll_timeout) else {
                tokio::task::yield_now().await;
                continue;
            };

            match event {
                ConsumerEvent::Message(message) => {
                    if let Step::Exit(exit) = self.handle_message(message).await {
                        return Ok(exit);
                    }
                }
                ConsumerEvent::Error { code, message, fatal } => {
                    self.metrics.record_kafka_error(&code, fatal);
                    if fatal {
                        error!(%code, reason = %message, "fatal broker error, stopping consumer");
                        return Err(EngineError::BrokerFatal { code, reason: message });
                    }
                    warn!(%code, reason = %message, "broker error");
                }
                ConsumerEvent::Stats(raw) => self.handle_stats(&raw),
            }
        }
    }

    async fn handle_message(&mut self, message: RawEvent) -> Step {
        let headers = match parse_headers(&message.headers, self.settings.header_schema) {
            Ok(headers) => headers,
            Err(e) => {
                self.metrics.record_failure("ParseHeaders", Some(e.kind()));
                error!(error = %e, offset = %message.offset_record(), "failed to parse message headers");
                return Step::Exit(EngineExit::ProcessingFailure);
            }
        };

        if let Err(e) = self.processor.process(&headers, &message).await {
            error!(error = %e, offset = %message.offset_record(), "error processing message, restarting consumer");
            return Step::Exit(EngineExit::ProcessingFailure);
        }

        let record = message.offset_record();
        let mut ledger = self.ledger.lock();
        let due = ledger.should_commit(&record);
        ledger.record(record);
        if due {
            if let Err(e) = ledger.commit_pending(self.consumer.as_mut()) {
                self.metrics.record_consumer_error("CommitStoredOffsets", e.kind());
                error!(error = %e, pending = ledger.pending().len(), "error committing offsets");
            }
        }
        drop(ledger);

        self.metrics.record_processed(headers.operation_name());
        Step::Continue
    }

    fn handle_stats(&self, raw: &str) {
        let Some(collector) = &self.stats else {
            return;
        };
        match StatsData::from_json(raw) {
            Ok(stats) => collector.collect(&stats),
            Err(e) => {
                self.metrics.record_consumer_error("StatsCollection", "InvalidStats");
                error!(error = %e, "failed to decode consumer statistics");
            }
        }
    }

    /// Commits what is pending and closes the broker connection. Calling it
    /// again after it completed returns [`ShutdownOutcome::AlreadyClosed`].
    pub fn shutdown(&mut self) -> Result<ShutdownOutcome, EngineError> {
        if self.state == LifecycleState::Closed || self.consumer.is_closed() {
            self.state = LifecycleState::Closed;
            return Ok(ShutdownOutcome::AlreadyClosed);
        }
        self.state = LifecycleState::ShuttingDown;

        if let Err(e) = self.ledger.lock().commit_pending(self.consumer.as_mut()) {
            error!(error = %e, "error committing offsets on shutdown");
        }

        let closed = self.consumer.close();
        self.state = LifecycleState::Closed;
        closed.map_err(EngineError::Shutdown)?;
        info!("consumer closed");
        Ok(ShutdownOutcome::Closed)
    }
}
