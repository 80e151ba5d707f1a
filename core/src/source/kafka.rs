use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::config::ConsumerOptions;
use crate::errors::BrokerError;
use crate::source::{
    BrokerConsumer, ConsumerEvent, OffsetCommitter, OffsetRecord, RawEvent, RebalanceEvent,
    RebalanceHandler, TopicPartition,
};

/// Collects client callbacks so they surface as poll events on the polling thread.
#[derive(Default)]
pub struct InventoryConsumerContext {
    events: Mutex<VecDeque<ConsumerEvent>>,
    rebalance_handler: Mutex<Option<Box<dyn RebalanceHandler>>>,
}

impl InventoryConsumerContext {
    fn push(&self, event: ConsumerEvent) {
        self.events.lock().push_back(event);
    }

    fn next_event(&self) -> Option<ConsumerEvent> {
        self.events.lock().pop_front()
    }

    fn set_rebalance_handler(&self, handler: Box<dyn RebalanceHandler>) {
        *self.rebalance_handler.lock() = Some(handler);
    }
}

impl ClientContext for InventoryConsumerContext {
    fn stats_raw(&self, statistics: &[u8]) {
        self.push(ConsumerEvent::Stats(
            String::from_utf8_lossy(statistics).into_owned(),
        ));
    }

    fn error(&self, error: KafkaError, reason: &str) {
        debug!(%error, reason, "client error callback");
        self.push(error_event(&error));
    }
}

impl ConsumerContext for InventoryConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let event = match rebalance {
            Rebalance::Assign(tpl) => RebalanceEvent::Assigned(topic_partitions(tpl)),
            Rebalance::Revoke(tpl) => RebalanceEvent::Revoked(topic_partitions(tpl)),
            Rebalance::Error(e) => RebalanceEvent::Failed(e.to_string()),
        };

        if let Some(handler) = self.rebalance_handler.lock().as_mut() {
            let mut committer = RebalanceCommitter {
                consumer: base_consumer,
            };
            handler.on_rebalance(&event, &mut committer);
        }
    }
}

type InventoryBaseConsumer = BaseConsumer<InventoryConsumerContext>;

/// Commits through the consumer handed to the rebalance callback.
struct RebalanceCommitter<'a> {
    consumer: &'a InventoryBaseConsumer,
}

impl OffsetCommitter for RebalanceCommitter<'_> {
    fn commit_offsets(&mut self, offsets: &[OffsetRecord]) -> Result<Vec<OffsetRecord>, BrokerError> {
        commit_records(self.consumer, offsets)
    }

    fn assignment_lost(&self) -> bool {
        self.consumer.assignment_lost()
    }
}

fn topic_partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition {
            topic: elem.topic().to_string(),
            partition: elem.partition(),
        })
        .collect()
}

fn error_event(error: &KafkaError) -> ConsumerEvent {
    let code = error.rdkafka_error_code();
    ConsumerEvent::Error {
        code: code.map_or_else(|| "Unknown".to_string(), |c| format!("{c:?}")),
        message: error.to_string(),
        fatal: code == Some(RDKafkaErrorCode::Fatal),
    }
}

/// Commits `highest offset + 1` for each partition present in `offsets`.
fn commit_records(
    consumer: &InventoryBaseConsumer,
    offsets: &[OffsetRecord],
) -> Result<Vec<OffsetRecord>, BrokerError> {
    let mut highest: BTreeMap<(&str, i32), i64> = BTreeMap::new();
    for record in offsets {
        let entry = highest
            .entry((record.topic.as_str(), record.partition))
            .or_insert(record.offset);
        *entry = (*entry).max(record.offset);
    }

    let mut tpl = TopicPartitionList::new();
    let mut committed = Vec::with_capacity(highest.len());
    for ((topic, partition), offset) in highest {
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| BrokerError::OffsetCommit {
                reason: e.to_string(),
            })?;
        committed.push(OffsetRecord {
            topic: topic.to_string(),
            partition,
            offset: offset + 1,
        });
    }

    consumer
        .commit(&tpl, CommitMode::Sync)
        .map_err(|e| BrokerError::OffsetCommit {
            reason: e.to_string(),
        })?;
    Ok(committed)
}

fn convert_message(message: &BorrowedMessage<'_>) -> RawEvent {
    let mut headers = Vec::new();
    if let Some(header_map) = message.headers() {
        for header in header_map.iter() {
            headers.push((
                header.key.to_string(),
                header.value.map(<[u8]>::to_vec).unwrap_or_default(),
            ));
        }
    }

    RawEvent {
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec),
        headers,
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
    }
}

pub fn client_config(options: &ConsumerOptions) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", options.bootstrap_servers.join(","))
        .set("group.id", &options.consumer_group_id)
        .set("session.timeout.ms", options.session_timeout_ms.to_string())
        .set("heartbeat.interval.ms", options.heartbeat_interval_ms.to_string())
        .set("max.poll.interval.ms", options.max_poll_interval_ms.to_string())
        .set("enable.auto.commit", options.enable_auto_commit.to_string())
        .set("auto.offset.reset", &options.auto_offset_reset)
        .set("statistics.interval.ms", options.statistics_interval_ms.to_string())
        .set("enable.partition.eof", "false");

    if !options.debug.is_empty() {
        client_config.set("debug", &options.debug);
    }

    let auth = &options.auth;
    if auth.enabled {
        for (key, value) in [
            ("security.protocol", &auth.security_protocol),
            ("sasl.mechanism", &auth.sasl_mechanism),
            ("sasl.username", &auth.sasl_username),
            ("sasl.password", &auth.sasl_password),
            ("ssl.ca.location", &auth.ca_cert_location),
        ] {
            if let Some(value) = value {
                client_config.set(key, value);
            }
        }
    }

    client_config
}

/// rdkafka-backed [`BrokerConsumer`].
pub struct KafkaBrokerConsumer {
    consumer: Option<InventoryBaseConsumer>,
}

impl KafkaBrokerConsumer {
    pub fn new(options: &ConsumerOptions) -> Result<Self, BrokerError> {
        let consumer: InventoryBaseConsumer = client_config(options)
            .create_with_context(InventoryConsumerContext::default())
            .map_err(|e| BrokerError::ConsumerCreation {
                reason: e.to_string(),
            })?;

        Ok(Self {
            consumer: Some(consumer),
        })
    }

    fn consumer(&self) -> Result<&InventoryBaseConsumer, BrokerError> {
        self.consumer.as_ref().ok_or(BrokerError::Closed)
    }
}

impl OffsetCommitter for KafkaBrokerConsumer {
    fn commit_offsets(&mut self, offsets: &[OffsetRecord]) -> Result<Vec<OffsetRecord>, BrokerError> {
        commit_records(self.consumer()?, offsets)
    }

    fn assignment_lost(&self) -> bool {
        self.consumer
            .as_ref()
            .is_some_and(|consumer| consumer.assignment_lost())
    }
}

impl BrokerConsumer for KafkaBrokerConsumer {
    fn subscribe(&mut self, topics: &[String], handler: Box<dyn RebalanceHandler>) -> Result<(), BrokerError> {
        let consumer = self.consumer()?;
        consumer.context().set_rebalance_handler(handler);

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BrokerError::Subscription {
                topics: topics.join(", "),
                reason: e.to_string(),
            })?;

        info!("subscribed to topics: {}", topics.join(", "));
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Option<ConsumerEvent> {
        let consumer = self.consumer.as_ref()?;
        if let Some(event) = consumer.context().next_event() {
            return Some(event);
        }

        // librdkafka blocks the calling thread for up to `timeout`.
        let polled = tokio::task::block_in_place(|| {
            consumer
                .poll(timeout)
                .map(|result| result.map(|message| convert_message(&message)))
        });

        match polled {
            Some(Ok(event)) => Some(ConsumerEvent::Message(event)),
            Some(Err(e)) => Some(error_event(&e)),
            None => consumer.context().next_event(),
        }
    }

    fn is_closed(&self) -> bool {
        self.consumer.is_none()
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        let Some(consumer) = self.consumer.take() else {
            return Err(BrokerError::Closed);
        };
        consumer.unsubscribe();
        drop(consumer);
        info!("kafka consumer closed");
        Ok(())
    }
}
