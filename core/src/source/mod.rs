pub mod kafka;

use std::fmt;
use std::time::Duration;

use crate::errors::BrokerError;

/// A record received from the broker, owned by the poll iteration that read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub key: Option<Vec<u8>>,
    /// `None` or empty for tombstones.
    pub value: Option<Vec<u8>>,
    /// Headers in the order they were produced.
    pub headers: Vec<(String, Vec<u8>)>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl RawEvent {
    pub fn offset_record(&self) -> OffsetRecord {
        OffsetRecord {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Position of a processed record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffsetRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for OffsetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.partition, self.offset)
    }
}

/// Something returned by a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Message(RawEvent),
    Error { code: String, message: String, fatal: bool },
    /// Raw statistics JSON emitted by the client.
    Stats(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
    Failed(String),
}

/// Offset commits against the group coordinator.
pub trait OffsetCommitter {
    /// Commits the highest offset seen per partition and returns what was committed.
    fn commit_offsets(&mut self, offsets: &[OffsetRecord]) -> Result<Vec<OffsetRecord>, BrokerError>;

    /// True when the partition assignment was lost involuntarily.
    fn assignment_lost(&self) -> bool;
}

/// Invoked synchronously from inside [`BrokerConsumer::poll`] whenever the
/// group rebalances, on the polling thread.
pub trait RebalanceHandler: Send {
    fn on_rebalance(&mut self, event: &RebalanceEvent, committer: &mut dyn OffsetCommitter);
}

/// The broker operations the consumption engine relies on.
pub trait BrokerConsumer: OffsetCommitter + Send {
    fn subscribe(&mut self, topics: &[String], handler: Box<dyn RebalanceHandler>) -> Result<(), BrokerError>;

    /// Waits up to `timeout` for the next event. `None` when nothing arrived.
    fn poll(&mut self, timeout: Duration) -> Option<ConsumerEvent>;

    fn is_closed(&self) -> bool;

    fn close(&mut self) -> Result<(), BrokerError>;
}

/// Creates a fresh broker connection for every engine run.
pub trait ConsumerFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}

impl<F> ConsumerFactory for F
where
    F: Fn() -> Result<Box<dyn BrokerConsumer>, BrokerError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        self()
    }
}

/// Formats committed offsets as `[partition:offset],...`.
pub fn format_offsets(offsets: &[OffsetRecord]) -> String {
    offsets
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
