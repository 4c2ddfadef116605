//! Publisher: topic bootstrap, retried sends, and the interval publish loop.
//!
//! # Delivery guarantees
//!
//! - **At-least-once**: a publish that returns `Ok` was appended exactly once
//!   *as far as the broker acknowledged*. A send that timed out ambiguously is
//!   retried, and the broker may already hold the first copy, so the topic can
//!   contain duplicates. Every record carries a `message_id` header that stays
//!   the same across retries of one `publish` call; handlers deduplicate on it.
//! - **Fatal means not sent**: `PublishError::Fatal` is only returned when no
//!   attempt was acknowledged.
//! - **Ordering**: sends from one `Publisher` are serialized, so records with
//!   the same key are never interleaved by concurrent callers.

use crate::error::{PublishError, TopicError};
use crate::metrics::StreamMetrics;
use crate::model::{
    OutboundRecord, PublishReceipt, TopicName, TopicSpec, MESSAGE_ID_HEADER, PRODUCED_AT_HEADER,
};
use crate::shutdown;
use crate::transport::{ProducerTransport, TopicStatus};
use chrono::Utc;
use resilience::{with_retry_if, RetryConfig, RetryError};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Backoff policy for transient send failures
    pub retry: RetryConfig,
    /// Used when a topic has to be created
    pub topic_spec: TopicSpec,
    /// How long `close` waits for queued records
    pub flush_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            retry: resilience::publish_config().retry,
            topic_spec: TopicSpec::default(),
            flush_timeout: Duration::from_secs(10),
        }
    }
}

/// One payload produced by a `PayloadSource`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub key: Option<Vec<u8>>,
    pub body: Vec<u8>,
}

impl Payload {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            body: body.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Supplies payloads to the publish loop. Returning `None` ends the loop.
pub trait PayloadSource: Send {
    fn next_payload(&mut self) -> Option<Payload>;
}

impl<F> PayloadSource for F
where
    F: FnMut() -> Option<Payload> + Send,
{
    fn next_payload(&mut self) -> Option<Payload> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stop signal received
    Interrupted,
    /// Payload source returned `None`
    SourceExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishLoopReport {
    pub sent: u64,
    pub stop_reason: StopReason,
}

pub struct Publisher<T: ProducerTransport> {
    transport: T,
    config: PublisherConfig,
    /// Topics known to exist; the lock also serializes sends
    ensured: Mutex<HashSet<TopicName>>,
    metrics: Option<StreamMetrics>,
}

impl<T: ProducerTransport> Publisher<T> {
    pub fn new(transport: T, config: PublisherConfig) -> Self {
        Self {
            transport,
            config,
            ensured: Mutex::new(HashSet::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: StreamMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Make sure `topic` exists, creating it if needed. Idempotent.
    pub async fn ensure_topic(&self, topic: &TopicName) -> Result<TopicStatus, TopicError> {
        let mut ensured = self.ensured.lock().await;
        self.ensure_topic_locked(&mut ensured, topic).await
    }

    async fn ensure_topic_locked(
        &self,
        ensured: &mut HashSet<TopicName>,
        topic: &TopicName,
    ) -> Result<TopicStatus, TopicError> {
        let status = self
            .transport
            .ensure_topic(topic, self.config.topic_spec)
            .await?;

        match status {
            TopicStatus::Created => info!(topic = %topic, "Kafka topic created"),
            TopicStatus::AlreadyExists => debug!(topic = %topic, "Kafka topic already exists"),
        }

        ensured.insert(topic.clone());
        Ok(status)
    }

    /// Publish one payload and wait for the broker acknowledgement.
    ///
    /// Transient failures are retried with exponential backoff up to
    /// `retry.max_attempts`; after that the error becomes `PublishError::Fatal`.
    pub async fn publish(
        &self,
        topic: &TopicName,
        payload: impl Into<Vec<u8>>,
        key: Option<&[u8]>,
    ) -> Result<PublishReceipt, PublishError> {
        let mut ensured = self.ensured.lock().await;

        if !ensured.contains(topic) {
            self.ensure_topic_locked(&mut ensured, topic)
                .await
                .map_err(|e| topic_error_to_publish(topic, e))?;
        }

        let record = OutboundRecord {
            topic: topic.clone(),
            key: key.map(<[u8]>::to_vec),
            payload: payload.into(),
            headers: BTreeMap::from([
                (MESSAGE_ID_HEADER.to_string(), Uuid::new_v4().to_string()),
                (PRODUCED_AT_HEADER.to_string(), Utc::now().to_rfc3339()),
            ]),
        };

        let mut attempts = 0u32;
        let result = with_retry_if(self.config.retry.clone(), PublishError::is_transient, || {
            attempts += 1;
            self.transport.send(&record)
        })
        .await;

        if let Some(metrics) = &self.metrics {
            metrics
                .publish_retries
                .inc_by(u64::from(attempts.saturating_sub(1)));
        }

        match result {
            Ok(delivery) => {
                if let Some(metrics) = &self.metrics {
                    metrics.published.inc();
                }
                Ok(PublishReceipt {
                    topic: topic.clone(),
                    partition: delivery.partition,
                    offset: delivery.offset,
                    attempts,
                })
            }
            Err(err) => {
                let err = into_fatal(topic, err);
                if let Some(metrics) = &self.metrics {
                    metrics.publish_failures.inc();
                }
                error!(
                    topic = %topic,
                    attempts,
                    error = %err,
                    "Message was not durably sent"
                );
                Err(err)
            }
        }
    }

    /// Flush queued records. Called on every exit path of `run`.
    pub async fn close(&self) -> Result<(), PublishError> {
        let _guard = self.ensured.lock().await;
        self.transport.flush(self.config.flush_timeout).await
    }

    /// Publish one payload from `source` every `interval` until stopped.
    ///
    /// The stop signal is checked between ticks; a publish that already
    /// started always runs to completion. A fatal publish error ends the loop
    /// and is returned. The transport is flushed before returning either way.
    pub async fn run<S: PayloadSource>(
        &self,
        topic: &TopicName,
        interval: Duration,
        source: &mut S,
        mut stop: watch::Receiver<bool>,
    ) -> Result<PublishLoopReport, PublishError> {
        info!(
            topic = %topic,
            interval_ms = interval.as_millis() as u64,
            "Starting message production"
        );

        let mut sent = 0u64;
        let outcome = self
            .run_inner(topic, interval, source, &mut stop, &mut sent)
            .await;

        if let Err(e) = self.close().await {
            warn!(topic = %topic, error = %e, "Flush on shutdown failed");
        }
        info!(topic = %topic, sent, "Kafka producer closed");

        outcome.map(|stop_reason| PublishLoopReport { sent, stop_reason })
    }

    async fn run_inner<S: PayloadSource>(
        &self,
        topic: &TopicName,
        interval: Duration,
        source: &mut S,
        stop: &mut watch::Receiver<bool>,
        sent: &mut u64,
    ) -> Result<StopReason, PublishError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown::stopped(stop) => {
                    warn!(topic = %topic, "Producer interrupted");
                    return Ok(StopReason::Interrupted);
                }
                _ = ticker.tick() => {}
            }

            let Some(payload) = source.next_payload() else {
                info!(topic = %topic, "Payload source exhausted");
                return Ok(StopReason::SourceExhausted);
            };

            debug!(
                topic = %topic,
                payload = %String::from_utf8_lossy(&payload.body),
                "Generated payload"
            );

            let receipt = self
                .publish(topic, payload.body, payload.key.as_deref())
                .await?;
            *sent += 1;

            info!(
                topic = %topic,
                partition = receipt.partition,
                offset = receipt.offset,
                attempts = receipt.attempts,
                "Sent message to topic"
            );
        }
    }
}

fn topic_error_to_publish(topic: &TopicName, err: TopicError) -> PublishError {
    match err {
        TopicError::BrokerUnavailable { reason, .. } => PublishError::Fatal {
            topic: topic.to_string(),
            attempts: 1,
            reason: format!("topic unavailable: {}", reason),
        },
        other => PublishError::fatal(topic.as_str(), other.to_string()),
    }
}

fn into_fatal(topic: &TopicName, err: RetryError<PublishError>) -> PublishError {
    match err {
        RetryError::Exhausted { attempts, last } => PublishError::Fatal {
            topic: topic.to_string(),
            attempts,
            reason: format!("retry budget exhausted: {}", last.reason()),
        },
        RetryError::Aborted { attempt, error } => PublishError::Fatal {
            topic: topic.to_string(),
            attempts: attempt,
            reason: error.reason().to_string(),
        },
    }
}
