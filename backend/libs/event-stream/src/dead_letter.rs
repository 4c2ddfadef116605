//! Dead-letter routing for messages that keep failing their handler.

use crate::error::{HandlerError, PublishError};
use crate::model::{Message, TopicName};
use crate::publisher::Publisher;
use crate::transport::ProducerTransport;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Envelope written to the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Base64 of the original key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Base64 of the original payload
    pub payload: String,
    pub headers: BTreeMap<String, String>,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(message: &Message, error: &HandlerError, attempts: u32) -> Self {
        Self {
            original_topic: message.topic.to_string(),
            partition: message.partition,
            offset: message.offset,
            key: message.key.as_ref().map(|k| STANDARD.encode(k)),
            payload: STANDARD.encode(&message.payload),
            headers: message.headers.clone(),
            error: format!("{:#}", error),
            attempts,
            failed_at: Utc::now(),
        }
    }

    pub fn decode_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.payload)
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, record: &DeadLetterRecord) -> Result<(), PublishError>;

    /// Flush and release whatever connection the sink holds.
    async fn close(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Publishes dead letters as JSON to a dedicated topic.
pub struct TopicDeadLetterSink<T: ProducerTransport> {
    publisher: Publisher<T>,
    topic: TopicName,
}

impl<T: ProducerTransport> TopicDeadLetterSink<T> {
    pub fn new(publisher: Publisher<T>, topic: TopicName) -> Self {
        Self { publisher, topic }
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }
}

#[async_trait]
impl<T: ProducerTransport> DeadLetterSink for TopicDeadLetterSink<T> {
    async fn send(&self, record: &DeadLetterRecord) -> Result<(), PublishError> {
        let body = serde_json::to_vec(record)
            .map_err(|e| PublishError::fatal(self.topic.as_str(), e.to_string()))?;
        let key = format!("{}-{}-{}", record.original_topic, record.partition, record.offset);

        let receipt = self
            .publisher
            .publish(&self.topic, body, Some(key.as_bytes()))
            .await?;

        warn!(
            dlq_topic = %self.topic,
            original_topic = %record.original_topic,
            partition = record.partition,
            offset = record.offset,
            dlq_offset = receipt.offset,
            attempts = record.attempts,
            "Message routed to dead-letter topic"
        );

        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.publisher.close().await
    }
}
