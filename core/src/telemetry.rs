use std::collections::HashMap;

use prometheus::core::Collector;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use serde::Deserialize;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const DEFAULT_LOG_DIRECTIVE: &str = "replicator_core=info,runner_container=info";

const PREFIX: &str = "consumer_";
const STATS_PREFIX: &str = "consumer_stats_";

pub fn init_tracing(default_directive: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(format!("{PREFIX}{name}"), help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntGaugeVec, prometheus::Error> {
    let gauge = IntGaugeVec::new(Opts::new(format!("{STATS_PREFIX}{name}"), help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Counters incremented by the consumption path. Cheap to clone.
#[derive(Clone)]
pub struct ConsumerMetrics {
    msgs_processed: IntCounterVec,
    msg_process_failures: IntCounterVec,
    consumer_errors: IntCounterVec,
    kafka_error_events: IntCounterVec,
}

impl ConsumerMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            msgs_processed: counter_vec(
                registry,
                "msgs_processed",
                "Messages fully processed, by operation",
                &["operation"],
            )?,
            msg_process_failures: counter_vec(
                registry,
                "msg_process_failures",
                "Failures while processing a message, by stage and cause",
                &["operation", "reason"],
            )?,
            consumer_errors: counter_vec(
                registry,
                "consumer_errors",
                "Consumer internal errors such as failed subscriptions or commits",
                &["operation", "reason"],
            )?,
            kafka_error_events: counter_vec(
                registry,
                "kafka_error_events",
                "Error events reported by the broker client",
                &["code", "fatal"],
            )?,
        })
    }

    pub fn record_processed(&self, operation: &str) {
        self.msgs_processed.with_label_values(&[operation]).inc();
    }

    /// `reason` is an error kind such as `"Transport"`, never a formatted error.
    pub fn record_failure(&self, operation: &str, reason: Option<&str>) {
        self.msg_process_failures
            .with_label_values(&[operation, reason.unwrap_or_default()])
            .inc();
    }

    pub fn record_consumer_error(&self, operation: &str, reason: &str) {
        self.consumer_errors.with_label_values(&[operation, reason]).inc();
    }

    pub fn record_kafka_error(&self, code: &str, fatal: bool) {
        let fatal = if fatal { "true" } else { "false" };
        self.kafka_error_events.with_label_values(&[code, fatal]).inc();
    }

    pub fn processed_count(&self, operation: &str) -> u64 {
        self.msgs_processed.with_label_values(&[operation]).get()
    }

    /// Failures for a stage, summed over every cause.
    pub fn failure_count(&self, operation: &str) -> u64 {
        sum_by_label(&self.msg_process_failures, "operation", operation)
    }

    pub fn consumer_error_count(&self, operation: &str) -> u64 {
        sum_by_label(&self.consumer_errors, "operation", operation)
    }

    pub fn kafka_error_count(&self) -> u64 {
        self.kafka_error_events
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }
}

fn sum_by_label(counter: &IntCounterVec, label: &str, value: &str) -> u64 {
    counter
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .filter(|m| {
            m.get_label()
                .iter()
                .any(|pair| pair.get_name() == label && pair.get_value() == value)
        })
        .map(|m| m.get_counter().get_value() as u64)
        .sum()
}

/// Subset of the broker client's statistics document that is exported.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsData {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub replyq: i64,
    #[serde(default)]
    pub topics: HashMap<String, TopicStats>,
    #[serde(default)]
    pub cgrp: GroupStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopicStats {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub partitions: HashMap<String, PartitionStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PartitionStats {
    pub fetchq_cnt: i64,
    pub fetchq_size: i64,
    pub fetch_state: String,
    pub lo_offset: i64,
    pub hi_offset: i64,
    pub ls_offset: i64,
    pub consumer_lag: i64,
    pub consumer_lag_stored: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupStats {
    pub state: String,
    pub stateage: i64,
    pub rebalance_age: i64,
    pub rebalance_cnt: i64,
    pub rebalance_reason: String,
    pub assignment_size: i64,
}

impl StatsData {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Turns statistics events into `consumer_stats_*` gauges.
#[derive(Clone)]
pub struct StatsCollector {
    subscribed_topics: Vec<String>,
    replyq: IntGaugeVec,
    fetchq_cnt: IntGaugeVec,
    fetchq_size: IntGaugeVec,
    fetch_state: IntGaugeVec,
    lo_offset: IntGaugeVec,
    hi_offset: IntGaugeVec,
    ls_offset: IntGaugeVec,
    consumer_lag: IntGaugeVec,
    consumer_lag_stored: IntGaugeVec,
    state: IntGaugeVec,
    stateage: IntGaugeVec,
    rebalance_age: IntGaugeVec,
    rebalance_cnt: IntGaugeVec,
    assignment_size: IntGaugeVec,
}

impl StatsCollector {
    pub fn new(registry: &Registry, subscribed_topics: Vec<String>) -> Result<Self, prometheus::Error> {
        const CLIENT: &[&str] = &["name", "client_id"];
        const PARTITION: &[&str] = &["name", "client_id", "topic", "partition"];

        Ok(Self {
            subscribed_topics,
            replyq: gauge_vec(registry, "replyq", "Ops waiting in queue for broker replies", CLIENT)?,
            fetchq_cnt: gauge_vec(registry, "fetchq_cnt", "Messages in the fetch queue", PARTITION)?,
            fetchq_size: gauge_vec(registry, "fetchq_size", "Bytes in the fetch queue", PARTITION)?,
            fetch_state: gauge_vec(
                registry,
                "fetch_state",
                "1 when the partition fetcher is not active",
                &["name", "client_id", "topic", "partition", "fetch_state"],
            )?,
            lo_offset: gauge_vec(registry, "lo_offset", "Partition low watermark", PARTITION)?,
            hi_offset: gauge_vec(registry, "hi_offset", "Partition high watermark", PARTITION)?,
            ls_offset: gauge_vec(registry, "ls_offset", "Partition last stable offset", PARTITION)?,
            consumer_lag: gauge_vec(registry, "consumer_lag", "Consumer lag", PARTITION)?,
            consumer_lag_stored: gauge_vec(
                registry,
                "consumer_lag_stored",
                "Consumer lag against the stored offset",
                PARTITION,
            )?,
            state: gauge_vec(
                registry,
                "state",
                "1 when the consumer group is not up",
                &["name", "client_id", "state"],
            )?,
            stateage: gauge_vec(registry, "stateage", "Time in the current group state (ms)", CLIENT)?,
            rebalance_age: gauge_vec(
                registry,
                "rebalance_age",
                "Time since the last rebalance (ms)",
                &["name", "client_id", "last_rebalance_reason"],
            )?,
            rebalance_cnt: gauge_vec(registry, "rebalance_cnt", "Rebalances seen", CLIENT)?,
            assignment_size: gauge_vec(
                registry,
                "assignment_size",
                "Partitions currently assigned",
                CLIENT,
            )?,
        })
    }

    pub fn collect(&self, stats: &StatsData) {
        let client = [stats.name.as_str(), stats.client_id.as_str()];
        self.replyq.with_label_values(&client).set(stats.replyq);

        for topic in &self.subscribed_topics {
            let Some(topic_stats) = stats.topics.get(topic) else {
                continue;
            };
            for (partition, p) in &topic_stats.partitions {
                // librdkafka reports unassigned messages under partition -1
                if partition == "-1" {
                    continue;
                }
                let labels = [client[0], client[1], topic.as_str(), partition.as_str()];
                self.fetchq_cnt.with_label_values(&labels).set(p.fetchq_cnt);
                self.fetchq_size.with_label_values(&labels).set(p.fetchq_size);
                self.fetch_state
                    .with_label_values(&[
                        client[0],
                        client[1],
                        topic.as_str(),
                        partition.as_str(),
                        p.fetch_state.as_str(),
                    ])
                    .set(i64::from(p.fetch_state != "active"));
                self.lo_offset.with_label_values(&labels).set(p.lo_offset);
                self.hi_offset.with_label_values(&labels).set(p.hi_offset);
                self.ls_offset.with_label_values(&labels).set(p.ls_offset);
                self.consumer_lag.with_label_values(&labels).set(p.consumer_lag);
                self.consumer_lag_stored
                    .with_label_values(&labels)
                    .set(p.consumer_lag_stored);
            }
        }

        let group = &stats.cgrp;
        self.state
            .with_label_values(&[client[0], client[1], group.state.as_str()])
            .set(i64::from(group.state != "up"));
        self.stateage.with_label_values(&client).set(group.stateage);
        self.rebalance_age
            .with_label_values(&[client[0], client[1], group.rebalance_reason.as_str()])
            .set(group.rebalance_age);
        self.rebalance_cnt.with_label_values(&client).set(group.rebalance_cnt);
        self.assignment_size
            .with_label_values(&client)
            .set(group.assignment_size);

        debug!(name = %stats.name, state = %group.state, "collected broker statistics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UpstreamError;

    const STATS: &str = r#"{
        "name": "rdkafka#consumer-1",
        "client_id": "inventory-replicator",
        "replyq": 3,
        "topics": {
            "outbox.event.hbi.hosts": {
                "topic": "outbox.event.hbi.hosts",
                "partitions": {
                    "0": {"fetchq_cnt": 5, "fetch_state": "active", "hi_offset": 120, "consumer_lag": 7},
                    "-1": {"fetchq_cnt": 99, "fetch_state": "none"}
                }
            },
            "other": {
                "topic": "other",
                "partitions": {"0": {"fetchq_cnt": 42}}
            }
        },
        "cgrp": {"state": "up", "stateage": 1500, "rebalance_cnt": 2, "assignment_size": 1}
    }"#;

    fn gauge(registry: &Registry, name: &str) -> Vec<(Vec<(String, String)>, i64)> {
        registry
            .gather()
            .into_iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric().to_vec())
            .map(|m| {
                let labels = m
                    .get_label()
                    .iter()
                    .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
                    .collect();
                (labels, m.get_gauge().get_value() as i64)
            })
            .collect()
    }

    #[test]
    fn test_counters_register_and_count() {
        let registry = Registry::new();
        let metrics = ConsumerMetrics::new(&registry).unwrap();

        metrics.record_processed("ReportResource");
        metrics.record_processed("ReportResource");
        metrics.record_failure("Retry", Some("Transport"));
        metrics.record_failure("Retry", Some("Rpc"));
        metrics.record_failure("unknown-operation-type", None);
        metrics.record_consumer_error("CommitStoredOffsets", "OffsetCommit");
        metrics.record_kafka_error("AllBrokersDown", true);

        assert_eq!(metrics.processed_count("ReportResource"), 2);
        assert_eq!(metrics.processed_count("DeleteResource"), 0);
        assert_eq!(metrics.failure_count("Retry"), 2);
        assert_eq!(metrics.failure_count("unknown-operation-type"), 1);
        assert_eq!(metrics.consumer_error_count("CommitStoredOffsets"), 1);
        assert_eq!(metrics.kafka_error_count(), 1);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"consumer_msgs_processed".to_string()));
        assert!(names.contains(&"consumer_kafka_error_events".to_string()));
    }

    #[test]
    fn test_failure_labels_carry_the_error_kind() {
        let registry = Registry::new();
        let metrics = ConsumerMetrics::new(&registry).unwrap();

        for resource in ["host-1", "host-2", "host-3"] {
            let err = UpstreamError::NotFound {
                message: format!("resource {resource} not found"),
            };
            metrics.record_failure("DeleteResource", Some(err.kind()));
        }

        let series: Vec<Vec<(String, String)>> = registry
            .gather()
            .into_iter()
            .filter(|family| family.get_name() == "consumer_msg_process_failures")
            .flat_map(|family| family.get_metric().to_vec())
            .map(|m| {
                m.get_label()
                    .iter()
                    .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
                    .collect()
            })
            .collect();
        assert_eq!(series.len(), 1);
        assert!(series[0].contains(&("reason".to_string(), "NotFound".to_string())));
        assert_eq!(metrics.failure_count("DeleteResource"), 3);
    }

    #[test]
    fn test_registering_twice_fails() {
        let registry = Registry::new();
        ConsumerMetrics::new(&registry).unwrap();
        assert!(ConsumerMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_stats_collection_skips_unassigned_and_unsubscribed() {
        let registry = Registry::new();
        let collector =
            StatsCollector::new(&registry, vec!["outbox.event.hbi.hosts".to_string()]).unwrap();
        let stats = StatsData::from_json(STATS).unwrap();
        collector.collect(&stats);

        let fetchq = gauge(&registry, "consumer_stats_fetchq_cnt");
        assert_eq!(fetchq.len(), 1);
        assert_eq!(fetchq[0].1, 5);
        assert!(fetchq[0]
            .0
            .contains(&("partition".to_string(), "0".to_string())));

        let lag = gauge(&registry, "consumer_stats_consumer_lag");
        assert_eq!(lag[0].1, 7);

        let replyq = gauge(&registry, "consumer_stats_replyq");
        assert_eq!(replyq[0].1, 3);

        let state = gauge(&registry, "consumer_stats_state");
        assert_eq!(state[0].1, 0);
        assert_eq!(gauge(&registry, "consumer_stats_stateage")[0].1, 1500);
        assert_eq!(gauge(&registry, "consumer_stats_rebalance_cnt")[0].1, 2);
    }

    #[test]
    fn test_group_not_up_is_flagged() {
        let registry = Registry::new();
        let collector = StatsCollector::new(&registry, vec![]).unwrap();
        let stats = StatsData::from_json(r#"{"cgrp": {"state": "wait-join"}}"#).unwrap();
        collector.collect(&stats);

        let state = gauge(&registry, "consumer_stats_state");
        assert_eq!(state[0].1, 1);
    }

    #[test]
    fn test_malformed_stats_fail_to_decode() {
        assert!(StatsData::from_json("not json").is_err());
        assert!(StatsData::from_json(r#"{"replyq": "many"}"#).is_err());
    }
}
