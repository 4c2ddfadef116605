//! Core data model: topics, messages, offsets, and start policies.

use crate::error::TopicError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const MAX_TOPIC_NAME_LEN: usize = 249;

/// Header carrying a per-publish UUID, stable across retries of one publish call.
pub const MESSAGE_ID_HEADER: &str = "message_id";

/// Header carrying the RFC 3339 time the publisher created the record.
pub const PRODUCED_AT_HEADER: &str = "produced_at";

/// Validated topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicName(String);

impl TopicName {
    pub fn new(name: impl Into<String>) -> Result<Self, TopicError> {
        let name = name.into();
        let invalid = |reason: &str| TopicError::InvalidName {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if name.trim().is_empty() {
            return Err(invalid("topic name must not be empty"));
        }
        if name.len() > MAX_TOPIC_NAME_LEN {
            return Err(invalid("topic name exceeds 249 characters"));
        }
        if name == "." || name == ".." {
            return Err(invalid("'.' and '..' are reserved"));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(invalid(&format!("illegal character '{}'", c)));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TopicName {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicName::new(s)
    }
}

impl TryFrom<String> for TopicName {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TopicName::new(value)
    }
}

impl From<TopicName> for String {
    fn from(value: TopicName) -> Self {
        value.0
    }
}

/// Consumer group identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A (topic, partition) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: TopicName,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: TopicName, partition: i32) -> Self {
        Self { topic, partition }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Where a group's cursor starts on partitions that have no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPolicy {
    #[default]
    Earliest,
    Latest,
    FromOffset(i64),
}

impl FromStr for StartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "earliest" | "beginning" => Ok(StartPolicy::Earliest),
            "latest" | "end" => Ok(StartPolicy::Latest),
            other => other
                .parse::<i64>()
                .ok()
                .filter(|offset| *offset >= 0)
                .map(StartPolicy::FromOffset)
                .ok_or_else(|| format!("Unknown start policy: {}", s)),
        }
    }
}

/// Record handed to a transport for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: TopicName,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

/// Broker acknowledgement for a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: TopicName,
    pub partition: i32,
    pub offset: i64,
    /// Attempts it took, 1 when the first send succeeded
    pub attempts: u32,
}

/// A message delivered to a subscriber. Offset is assigned by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: TopicName,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub headers: BTreeMap<String, String>,
}

impl Message {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Payload as UTF-8, replacing invalid sequences.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Offset of the last handled message for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOffset {
    pub partition: TopicPartition,
    pub offset: i64,
}

/// Topic creation parameters used when a topic is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSpec {
    pub partitions: i32,
    pub replication_factor: i32,
}

impl Default for TopicSpec {
    fn default() -> Self {
        Self {
            partitions: 1,
            replication_factor: 1,
        }
    }
}
