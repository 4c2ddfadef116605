//! Broker transport traits.
//!
//! The publisher and subscriber are written against these traits. `kafka`
//! implements them on rdkafka; `memory` implements them in-process for tests.

use crate::error::{BrokerError, PublishError, TopicError};
use crate::model::{CommitOffset, GroupId, Message, OutboundRecord, StartPolicy, TopicName, TopicSpec};
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of an idempotent topic check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicStatus {
    Created,
    AlreadyExists,
}

/// Partition and offset the broker assigned to an appended record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProducerTransport: Send + Sync {
    /// Create the topic if it is missing.
    async fn ensure_topic(&self, topic: &TopicName, spec: TopicSpec)
        -> Result<TopicStatus, TopicError>;

    /// Send one record and wait for the broker acknowledgement.
    ///
    /// Failures must be classified: `PublishError::Transient` when a retry
    /// may succeed, `PublishError::Fatal` otherwise.
    async fn send(&self, record: &OutboundRecord) -> Result<Delivery, PublishError>;

    /// Wait for queued records to be delivered.
    async fn flush(&self, timeout: Duration) -> Result<(), PublishError>;
}

#[async_trait]
pub trait ConsumerTransport: Send {
    /// Join `group` on `topic`; `start` applies to partitions without a committed offset.
    async fn subscribe(
        &mut self,
        topic: &TopicName,
        group: &GroupId,
        start: StartPolicy,
    ) -> Result<(), BrokerError>;

    /// Return up to `max_messages`, in offset order per partition, waiting at most `timeout`.
    async fn fetch(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, BrokerError>;

    /// Durably record each offset as the last handled message of its partition.
    async fn commit(&mut self, offsets: &[CommitOffset]) -> Result<(), BrokerError>;

    /// Leave the group and release the connection.
    async fn close(&mut self) -> Result<(), BrokerError>;
}
