//! Subscriber: group membership, ordered polling, and commit-after-handle.
//!
//! Offsets are never committed on receipt. A message's offset becomes
//! committable only after its handler returned `Ok` (or after it was routed
//! to the dead-letter sink), which gives at-least-once delivery: a crash
//! between handling and committing redelivers the message on restart, so
//! handlers must be idempotent.

use crate::dead_letter::{DeadLetterRecord, DeadLetterSink};
use crate::error::{HandlerError, SubscriberError};
use crate::metrics::StreamMetrics;
use crate::model::{CommitOffset, GroupId, Message, StartPolicy, TopicName, TopicPartition};
use crate::shutdown;
use crate::state::SubscriptionState;
use crate::transport::ConsumerTransport;
use async_trait::async_trait;
use resilience::{with_retry_if, with_timeout_result, RetryConfig, TimeoutError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Application callback for delivered messages. Must be idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (**self).handle(message).await
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Upper bound on messages returned by one poll
    pub max_batch_size: usize,
    /// How long one poll waits for messages
    pub poll_timeout: Duration,
    /// Backoff between handler attempts; the attempt budget comes from `FailurePolicy`
    pub handler_retry: RetryConfig,
    /// Time limit for one handler invocation
    pub handler_timeout: Duration,
    /// Pause after a transient poll or commit failure
    pub error_backoff: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        let handler = resilience::handler_config();
        Self {
            max_batch_size: 100,
            poll_timeout: Duration::from_secs(1),
            handler_retry: handler.retry,
            handler_timeout: handler.timeout.duration,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Messages returned by one poll, in offset order per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    messages: Vec<Message>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }
}

impl IntoIterator for Batch {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

/// A live group membership on one topic.
pub struct Subscription<C: ConsumerTransport> {
    transport: C,
    topic: TopicName,
    group: GroupId,
    state: SubscriptionState,
    max_batch_size: usize,
    last_delivered: HashMap<i32, i64>,
    committed: HashMap<i32, i64>,
    /// Handled but not yet committed, per partition
    handled: BTreeMap<i32, i64>,
}

impl<C: ConsumerTransport> Subscription<C> {
    /// Join `group` on `topic`. `start` only matters for partitions without a committed offset.
    pub async fn subscribe(
        transport: C,
        topic: TopicName,
        group: GroupId,
        start: StartPolicy,
        max_batch_size: usize,
    ) -> Result<Self, SubscriberError> {
        let mut subscription = Self {
            transport,
            topic,
            group,
            state: SubscriptionState::Created,
            max_batch_size: max_batch_size.max(1),
            last_delivered: HashMap::new(),
            committed: HashMap::new(),
            handled: BTreeMap::new(),
        };

        subscription.transition(SubscriptionState::Connecting)?;
        info!(
            topic = %subscription.topic,
            group = %subscription.group,
            start_policy = ?start,
            "Subscribing consumer group"
        );

        if let Err(e) = subscription
            .transport
            .subscribe(&subscription.topic, &subscription.group, start)
            .await
        {
            error!(topic = %subscription.topic, error = %e, "Subscription failed");
            subscription.state = SubscriptionState::Failed;
            let _ = subscription.transport.close().await;
            return Err(e.into());
        }

        subscription.transition(SubscriptionState::Polling)?;
        Ok(subscription)
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn last_delivered(&self, partition: i32) -> Option<i64> {
        self.last_delivered.get(&partition).copied()
    }

    /// Committed offset as seen by this subscription (commits made through it).
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.committed.get(&partition).copied()
    }

    fn transition(&mut self, next: SubscriptionState) -> Result<(), SubscriberError> {
        if !self.state.can_transition_to(next) {
            return Err(SubscriberError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(topic = %self.topic, from = %self.state, to = %next, "Subscription state change");
        self.state = next;
        Ok(())
    }

    /// Fetch the next bounded batch, waiting up to `timeout` if nothing is available.
    ///
    /// Successive calls continue from the last delivered position.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Batch, SubscriberError> {
        if self.state != SubscriptionState::Polling {
            return Err(SubscriberError::InvalidTransition {
                from: self.state,
                to: SubscriptionState::Polling,
            });
        }

        let messages = match self.transport.fetch(self.max_batch_size, timeout).await {
            Ok(messages) => messages,
            Err(e) => {
                if e.is_fatal() {
                    self.state = SubscriptionState::Failed;
                }
                return Err(e.into());
            }
        };

        for message in &messages {
            let entry = self.last_delivered.entry(message.partition).or_insert(message.offset);
            *entry = (*entry).max(message.offset);
        }

        Ok(Batch { messages })
    }

    /// Record that `message` was handled so its offset may be committed.
    pub fn mark_handled(&mut self, message: &Message) -> Result<(), SubscriberError> {
        let last = self.last_delivered(message.partition);
        if message.topic != self.topic || last.map_or(true, |last| message.offset > last) {
            return Err(SubscriberError::CommitAhead {
                topic: message.topic.to_string(),
                partition: message.partition,
                offset: message.offset,
                last_delivered: last,
            });
        }

        let entry = self.handled.entry(message.partition).or_insert(message.offset);
        *entry = (*entry).max(message.offset);
        Ok(())
    }

    /// Offsets handled since the last commit.
    pub fn pending_commits(&self) -> Vec<CommitOffset> {
        self.handled
            .iter()
            .map(|(partition, offset)| CommitOffset {
                partition: TopicPartition::new(self.topic.clone(), *partition),
                offset: *offset,
            })
            .collect()
    }

    /// Commit everything marked handled.
    pub async fn commit_handled(&mut self) -> Result<(), SubscriberError> {
        let offsets = self.pending_commits();
        if offsets.is_empty() {
            if self.state == SubscriptionState::Handling {
                self.transition(SubscriptionState::Polling)?;
            }
            return Ok(());
        }
        self.commit(&offsets).await
    }

    /// Durably advance the group cursor.
    ///
    /// Each offset names the last handled message of its partition. Offsets
    /// past the last delivered message, or behind the current committed
    /// cursor, are rejected before anything reaches the broker.
    pub async fn commit(&mut self, offsets: &[CommitOffset]) -> Result<(), SubscriberError> {
        let mut accepted = Vec::with_capacity(offsets.len());

        for commit in offsets {
            let partition = commit.partition.partition;
            let last = self.last_delivered(partition);

            if commit.partition.topic != self.topic
                || last.map_or(true, |last| commit.offset > last)
            {
                return Err(SubscriberError::CommitAhead {
                    topic: commit.partition.topic.to_string(),
                    partition,
                    offset: commit.offset,
                    last_delivered: last,
                });
            }

            match self.committed(partition) {
                Some(committed) if commit.offset < committed => {
                    return Err(SubscriberError::CommitBehind {
                        topic: commit.partition.topic.to_string(),
                        partition,
                        offset: commit.offset,
                        committed,
                    });
                }
                Some(committed) if commit.offset == committed => {}
                _ => accepted.push(commit.clone()),
            }
        }

        self.transition(SubscriptionState::Committing)?;

        if !accepted.is_empty() {
            if let Err(e) = self.transport.commit(&accepted).await {
                if e.is_fatal() {
                    self.state = SubscriptionState::Failed;
                } else {
                    self.transition(SubscriptionState::Polling)?;
                }
                return Err(e.into());
            }

            for commit in &accepted {
                let partition = commit.partition.partition;
                self.committed.insert(partition, commit.offset);
                if self
                    .handled
                    .get(&partition)
                    .is_some_and(|handled| *handled <= commit.offset)
                {
                    self.handled.remove(&partition);
                }
                debug!(
                    topic = %self.topic,
                    partition,
                    offset = commit.offset,
                    "Offset committed"
                );
            }
        }

        self.transition(SubscriptionState::Polling)
    }

    fn begin_handling(&mut self) -> Result<(), SubscriberError> {
        self.transition(SubscriptionState::Handling)
    }

    /// Commit pending work, leave the group, and release the connection.
    pub async fn close(mut self) -> Result<(), SubscriberError> {
        let commit_result = if self.state == SubscriptionState::Failed {
            Ok(())
        } else {
            self.commit_handled().await
        };

        if !self.state.is_terminal() {
            self.transition(SubscriptionState::Closed)?;
        }
        let close_result = self.transport.close().await;

        info!(
            topic = %self.topic,
            group = %self.group,
            state = %self.state,
            "Kafka consumer closed"
        );

        commit_result?;
        close_result.map_err(Into::into)
    }

    async fn fail(mut self) {
        self.state = SubscriptionState::Failed;
        if let Err(e) = self.transport.close().await {
            warn!(topic = %self.topic, error = %e, "Close after failure also failed");
        }
        error!(topic = %self.topic, group = %self.group, "Subscription failed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeStopReason {
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeReport {
    pub handled: u64,
    pub dead_lettered: u64,
    pub stop_reason: ConsumeStopReason,
}

/// What happens to a message whose handler keeps failing.
#[derive(Clone)]
pub enum FailurePolicy {
    /// Retry, then stop the subscription and surface the error
    Halt { max_attempts: u32 },
    /// Retry, then route to `sink` and count the message as handled
    DeadLetter {
        max_attempts: u32,
        sink: Arc<dyn DeadLetterSink>,
    },
}

impl FailurePolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            FailurePolicy::Halt { max_attempts } | FailurePolicy::DeadLetter { max_attempts, .. } => {
                *max_attempts
            }
        }
    }
}

impl std::fmt::Debug for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Halt { max_attempts } => f
                .debug_struct("Halt")
                .field("max_attempts", max_attempts)
                .finish(),
            FailurePolicy::DeadLetter { max_attempts, .. } => f
                .debug_struct("DeadLetter")
                .field("max_attempts", max_attempts)
                .finish_non_exhaustive(),
        }
    }
}

/// Drives a subscription: poll, handle with retries, commit, repeat.
pub struct SubscriberLoop<H: MessageHandler> {
    handler: H,
    config: SubscriberConfig,
    policy: FailurePolicy,
    metrics: Option<StreamMetrics>,
}

enum MessageOutcome {
    Handled,
    DeadLettered,
}

impl<H: MessageHandler> SubscriberLoop<H> {
    pub fn new(handler: H, config: SubscriberConfig, policy: FailurePolicy) -> Self {
        Self {
            handler,
            config,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: StreamMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Run until the stop signal fires or an unrecoverable error occurs.
    ///
    /// The subscription is closed on every exit path. The stop signal is
    /// checked between polls and between messages; a handler invocation that
    /// already started is allowed to finish.
    pub async fn run<C: ConsumerTransport>(
        &self,
        mut subscription: Subscription<C>,
        stop: watch::Receiver<bool>,
    ) -> Result<ConsumeReport, SubscriberError> {
        info!(
            topic = %subscription.topic(),
            group = %subscription.group(),
            "Polling messages"
        );

        let mut report = ConsumeReport {
            handled: 0,
            dead_lettered: 0,
            stop_reason: ConsumeStopReason::Interrupted,
        };

        match self.run_inner(&mut subscription, &stop, &mut report).await {
            Ok(()) => {
                subscription.close().await?;
                info!(
                    handled = report.handled,
                    dead_lettered = report.dead_lettered,
                    "Consumer stopped cleanly"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Consumer stopped on unrecoverable error");
                subscription.fail().await;
                Err(e)
            }
        }
    }

    async fn run_inner<C: ConsumerTransport>(
        &self,
        subscription: &mut Subscription<C>,
        stop: &watch::Receiver<bool>,
        report: &mut ConsumeReport,
    ) -> Result<(), SubscriberError> {
        loop {
            if shutdown::is_stopped(stop) {
                warn!(topic = %subscription.topic(), "Consumer interrupted");
                return Ok(());
            }

            let batch = match subscription.poll(self.config.poll_timeout).await {
                Ok(batch) => batch,
                Err(SubscriberError::Broker(e)) if !e.is_fatal() => {
                    warn!(topic = %subscription.topic(), error = %e, "Transient poll failure");
                    tokio::time::sleep(self.config.error_backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if batch.is_empty() {
                continue;
            }

            subscription.begin_handling()?;
            let mut halted = None;

            for message in batch {
                if shutdown::is_stopped(stop) {
                    break;
                }

                if let Some(metrics) = &self.metrics {
                    metrics.consumed.inc();
                }
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Received message"
                );

                match self.process(&message).await {
                    Ok(outcome) => {
                        subscription.mark_handled(&message)?;
                        match outcome {
                            MessageOutcome::Handled => report.handled += 1,
                            MessageOutcome::DeadLettered => report.dead_lettered += 1,
                        }
                    }
                    Err(e) => {
                        halted = Some(e);
                        break;
                    }
                }
            }

            match subscription.commit_handled().await {
                Ok(()) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.commits.inc();
                    }
                }
                Err(SubscriberError::Broker(e)) if !e.is_fatal() && halted.is_none() => {
                    warn!(topic = %subscription.topic(), error = %e, "Commit failed, will retry with next batch");
                }
                Err(e) => return Err(halted.unwrap_or(e)),
            }

            if let Some(e) = halted {
                return Err(e);
            }
        }
    }

    async fn process(&self, message: &Message) -> Result<MessageOutcome, SubscriberError> {
        let handler = &self.handler;
        let timeout = self.config.handler_timeout;

        let retry = RetryConfig {
            max_attempts: self.policy.max_attempts(),
            ..self.config.handler_retry.clone()
        };

        let result = with_retry_if(
            retry,
            HandlerError::is_retryable,
            || async move {
                match with_timeout_result(timeout, handler.handle(message)).await {
                    Ok(()) => Ok(()),
                    Err(TimeoutError::OperationFailed(e)) => Err(e),
                    Err(TimeoutError::Elapsed(d)) => {
                        Err(HandlerError::transient(format!("handler timed out after {:?}", d)))
                    }
                }
            },
        )
        .await;

        let failure = match result {
            Ok(()) => return Ok(MessageOutcome::Handled),
            Err(failure) => failure,
        };

        let attempts = failure.attempts();
        let error = failure.into_inner();
        if let Some(metrics) = &self.metrics {
            metrics.handler_failures.inc();
        }
        error!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            attempts,
            error = %error,
            "Handler failed"
        );

        let FailurePolicy::DeadLetter { sink, .. } = &self.policy else {
            return Err(SubscriberError::Handler {
                topic: message.topic.to_string(),
                partition: message.partition,
                offset: message.offset,
                attempts,
                source: error,
            });
        };

        let record = DeadLetterRecord::new(message, &error, attempts);
        sink.send(&record)
            .await
            .map_err(|source| SubscriberError::DeadLetter {
                topic: message.topic.to_string(),
                partition: message.partition,
                offset: message.offset,
                source,
            })?;

        if let Some(metrics) = &self.metrics {
            metrics.dead_lettered.inc();
        }
        Ok(MessageOutcome::DeadLettered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BrokerError, PublishError};
    use crate::memory::InMemoryBroker;
    use crate::model::OutboundRecord;
    use crate::transport::ProducerTransport;
    use crate::TopicSpec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn topic() -> TopicName {
        TopicName::new("buzzline").unwrap()
    }

    fn group() -> GroupId {
        GroupId::new("default_group")
    }

    async fn seed(broker: &InMemoryBroker, payloads: &[&str]) {
        let producer = broker.producer();
        producer
            .ensure_topic(&topic(), TopicSpec::default())
            .await
            .unwrap();
        for payload in payloads {
            producer
                .send(&OutboundRecord {
                    topic: topic(),
                    key: None,
                    payload: payload.as_bytes().to_vec(),
                    headers: Default::default(),
                })
                .await
                .unwrap();
        }
    }

    async fn subscribe(broker: &InMemoryBroker) -> Subscription<crate::memory::MemoryConsumer> {
        Subscription::subscribe(broker.consumer(), topic(), group(), StartPolicy::Earliest, 100)
            .await
            .unwrap()
    }

    fn fast_config() -> SubscriberConfig {
        SubscriberConfig {
            poll_timeout: Duration::from_millis(10),
            handler_retry: RetryConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                jitter: None,
                ..Default::default()
            },
            error_backoff: Duration::from_millis(5),
            ..Default::default()
        }
    }

    struct FailOn {
        offset: i64,
        rejected: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for FailOn {
        async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if message.offset != self.offset {
                return Ok(());
            }
            if self.rejected {
                Err(HandlerError::rejected("unparseable"))
            } else {
                Err(HandlerError::transient("downstream unavailable"))
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_moves_to_polling() {
        let broker = InMemoryBroker::new();
        let subscription = subscribe(&broker).await;
        assert_eq!(subscription.state(), SubscriptionState::Polling);
    }

    #[tokio::test]
    async fn test_subscribe_fails_when_broker_unreachable() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);

        let result = Subscription::subscribe(
            broker.consumer(),
            topic(),
            group(),
            StartPolicy::Earliest,
            100,
        )
        .await;

        assert!(matches!(
            result,
            Err(SubscriberError::Broker(BrokerError::Connection(_)))
        ));
    }

    #[tokio::test]
    async fn test_earliest_returns_existing_messages_in_order() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["one", "two", "three"]).await;

        let mut subscription = subscribe(&broker).await;
        let batch = subscription.poll(Duration::from_millis(50)).await.unwrap();

        let payloads: Vec<_> = batch.iter().map(|m| m.payload_lossy().into_owned()).collect();
        assert_eq!(payloads, vec!["one", "two", "three"]);
        assert_eq!(subscription.last_delivered(0), Some(2));
    }

    #[tokio::test]
    async fn test_batch_is_bounded() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a", "b", "c", "d", "e"]).await;

        let mut subscription =
            Subscription::subscribe(broker.consumer(), topic(), group(), StartPolicy::Earliest, 2)
                .await
                .unwrap();

        assert_eq!(subscription.poll(Duration::from_millis(10)).await.unwrap().len(), 2);
        assert_eq!(subscription.poll(Duration::from_millis(10)).await.unwrap().len(), 2);
        assert_eq!(subscription.poll(Duration::from_millis(10)).await.unwrap().len(), 1);
        assert!(subscription.poll(Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_ahead_of_delivery_is_rejected() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a", "b"]).await;

        let mut subscription =
            Subscription::subscribe(broker.consumer(), topic(), group(), StartPolicy::Earliest, 1)
                .await
                .unwrap();
        subscription.poll(Duration::from_millis(10)).await.unwrap();

        let err = subscription
            .commit(&[CommitOffset {
                partition: TopicPartition::new(topic(), 0),
                offset: 1,
            }])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SubscriberError::CommitAhead {
                offset: 1,
                last_delivered: Some(0),
                ..
            }
        ));
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), None);
        assert_eq!(subscription.state(), SubscriptionState::Polling);
    }

    #[tokio::test]
    async fn test_commit_behind_cursor_is_rejected() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a", "b", "c"]).await;

        let mut subscription = subscribe(&broker).await;
        subscription.poll(Duration::from_millis(10)).await.unwrap();

        let at = |offset| CommitOffset {
            partition: TopicPartition::new(topic(), 0),
            offset,
        };
        subscription.commit(&[at(2)]).await.unwrap();
        let err = subscription.commit(&[at(1)]).await.unwrap_err();

        assert!(matches!(
            err,
            SubscriberError::CommitBehind {
                offset: 1,
                committed: 2,
                ..
            }
        ));
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), Some(2));
    }

    #[tokio::test]
    async fn test_close_commits_handled_messages() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a", "b"]).await;

        let mut subscription = subscribe(&broker).await;
        let batch = subscription.poll(Duration::from_millis(10)).await.unwrap();
        subscription.mark_handled(batch.iter().next().unwrap()).unwrap();
        subscription.close().await.unwrap();

        assert_eq!(broker.committed_offset(&group(), &topic(), 0), Some(0));
    }

    #[tokio::test]
    async fn test_halt_policy_commits_only_handled_prefix() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a", "b", "c"]).await;

        let handler = FailOn {
            offset: 1,
            rejected: false,
            calls: AtomicU32::new(0),
        };
        let consumer = SubscriberLoop::new(
            handler,
            fast_config(),
            FailurePolicy::Halt { max_attempts: 3 },
        );
        let (_shutdown, stop) = crate::Shutdown::new();

        let err = consumer
            .run(subscribe(&broker).await, stop)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SubscriberError::Handler {
                offset: 1,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), Some(0));
        // offset 0 once, offset 1 three times, offset 2 never
        assert_eq!(consumer.handler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejected_message_skips_retries() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["bad"]).await;

        let handler = FailOn {
            offset: 0,
            rejected: true,
            calls: AtomicU32::new(0),
        };
        let consumer = SubscriberLoop::new(
            handler,
            fast_config(),
            FailurePolicy::Halt { max_attempts: 5 },
        );
        let (_shutdown, stop) = crate::Shutdown::new();

        let err = consumer
            .run(subscribe(&broker).await, stop)
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriberError::Handler { attempts: 1, .. }));
        assert_eq!(consumer.handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), None);
    }

    struct FailingSink;

    #[async_trait]
    impl DeadLetterSink for FailingSink {
        async fn send(&self, record: &DeadLetterRecord) -> Result<(), PublishError> {
            Err(PublishError::fatal(record.original_topic.clone(), "dlq unavailable"))
        }
    }

    #[tokio::test]
    async fn test_failed_dead_letter_leaves_offset_uncommitted() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a"]).await;

        let handler = FailOn {
            offset: 0,
            rejected: true,
            calls: AtomicU32::new(0),
        };
        let consumer = SubscriberLoop::new(
            handler,
            fast_config(),
            FailurePolicy::DeadLetter {
                max_attempts: 2,
                sink: Arc::new(FailingSink),
            },
        );
        let (_shutdown, stop) = crate::Shutdown::new();

        let err = consumer
            .run(subscribe(&broker).await, stop)
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriberError::DeadLetter { offset: 0, .. }));
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), None);
    }

    #[tokio::test]
    async fn test_transient_poll_error_is_survived() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a"]).await;
        broker.fail_next_fetch(BrokerError::Transient("leader election".to_string()));

        let handler = FailOn {
            offset: -1,
            rejected: false,
            calls: AtomicU32::new(0),
        };
        let consumer = Arc::new(SubscriberLoop::new(
            handler,
            fast_config(),
            FailurePolicy::Halt { max_attempts: 1 },
        ));
        let (shutdown, stop) = crate::Shutdown::new();
        let subscription = subscribe(&broker).await;

        let task = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(subscription, stop).await })
        };

        for _ in 0..200 {
            if broker.committed_offset(&group(), &topic(), 0) == Some(0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.trigger();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.handled, 1);
        assert_eq!(report.stop_reason, ConsumeStopReason::Interrupted);
    }

    #[tokio::test]
    async fn test_from_offset_skips_earlier_offsets_published_later() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a", "b"]).await;

        let mut subscription = Subscription::subscribe(
            broker.consumer(),
            topic(),
            group(),
            StartPolicy::FromOffset(5),
            100,
        )
        .await
        .unwrap();
        seed(&broker, &["c", "d", "e", "f"]).await;

        let batch = subscription.poll(Duration::from_millis(20)).await.unwrap();
        let offsets: Vec<i64> = batch.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![5]);
    }

    #[tokio::test]
    async fn test_from_offset_ignored_once_group_has_committed() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a", "b", "c"]).await;

        let mut first = subscribe(&broker).await;
        let batch = first.poll(Duration::from_millis(10)).await.unwrap();
        first.mark_handled(batch.iter().next().unwrap()).unwrap();
        first.close().await.unwrap();

        let mut second = Subscription::subscribe(
            broker.consumer(),
            topic(),
            group(),
            StartPolicy::FromOffset(2),
            100,
        )
        .await
        .unwrap();
        let batch = second.poll(Duration::from_millis(10)).await.unwrap();
        let offsets: Vec<i64> = batch.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_fatal_poll_error_fails_subscription() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a"]).await;
        broker.fail_next_fetch(BrokerError::Fatal("Local: Fatal error".to_string()));

        let mut subscription = subscribe(&broker).await;
        let err = subscription.poll(Duration::from_millis(10)).await.unwrap_err();

        assert!(matches!(err, SubscriberError::Broker(BrokerError::Fatal(_))));
        assert_eq!(subscription.state(), SubscriptionState::Failed);
    }

    #[tokio::test]
    async fn test_fatal_poll_error_ends_loop() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a"]).await;
        broker.fail_next_fetch(BrokerError::Fatal("Local: Fatal error".to_string()));

        let handler = FailOn {
            offset: -1,
            rejected: false,
            calls: AtomicU32::new(0),
        };
        let consumer = SubscriberLoop::new(
            handler,
            fast_config(),
            FailurePolicy::Halt { max_attempts: 1 },
        );
        let (_shutdown, stop) = crate::Shutdown::new();

        let result = tokio::time::timeout(
            Duration::from_millis(500),
            consumer.run(subscribe(&broker).await, stop),
        )
        .await
        .expect("loop should stop on a fatal broker error");

        assert!(matches!(
            result,
            Err(SubscriberError::Broker(BrokerError::Fatal(_)))
        ));
        assert_eq!(consumer.handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), None);
    }

    #[tokio::test]
    async fn test_transient_commit_error_keeps_offsets_pending() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a"]).await;
        broker.fail_next_commit(BrokerError::Transient("coordinator moving".to_string()));

        let mut subscription = subscribe(&broker).await;
        let batch = subscription.poll(Duration::from_millis(10)).await.unwrap();
        subscription.begin_handling().unwrap();
        subscription.mark_handled(batch.iter().next().unwrap()).unwrap();

        let err = subscription.commit_handled().await.unwrap_err();
        assert!(matches!(err, SubscriberError::Broker(BrokerError::Transient(_))));
        assert_eq!(subscription.state(), SubscriptionState::Polling);
        assert_eq!(subscription.pending_commits().len(), 1);
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), None);

        seed(&broker, &["b"]).await;
        let batch = subscription.poll(Duration::from_millis(10)).await.unwrap();
        subscription.begin_handling().unwrap();
        subscription.mark_handled(batch.iter().next().unwrap()).unwrap();
        subscription.commit_handled().await.unwrap();

        assert!(subscription.pending_commits().is_empty());
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), Some(1));
    }

    #[tokio::test]
    async fn test_loop_survives_transient_commit_error() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a"]).await;
        broker.fail_next_commit(BrokerError::Transient("coordinator moving".to_string()));

        let handler = FailOn {
            offset: -1,
            rejected: false,
            calls: AtomicU32::new(0),
        };
        let consumer = Arc::new(SubscriberLoop::new(
            handler,
            fast_config(),
            FailurePolicy::Halt { max_attempts: 1 },
        ));
        let (shutdown, stop) = crate::Shutdown::new();
        let subscription = subscribe(&broker).await;

        let task = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(subscription, stop).await })
        };

        for _ in 0..200 {
            if consumer.handler.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), None);

        seed(&broker, &["b"]).await;
        for _ in 0..200 {
            if broker.committed_offset(&group(), &topic(), 0) == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.trigger();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.handled, 2);
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), Some(1));
    }

    #[tokio::test]
    async fn test_fatal_commit_error_fails_subscription() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a"]).await;
        broker.fail_next_commit(BrokerError::Fatal("Local: Fatal error".to_string()));

        let mut subscription = subscribe(&broker).await;
        let batch = subscription.poll(Duration::from_millis(10)).await.unwrap();
        subscription.begin_handling().unwrap();
        subscription.mark_handled(batch.iter().next().unwrap()).unwrap();

        let err = subscription.commit_handled().await.unwrap_err();
        assert!(matches!(err, SubscriberError::Broker(BrokerError::Fatal(_))));
        assert_eq!(subscription.state(), SubscriptionState::Failed);
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), None);
    }

    #[tokio::test]
    async fn test_fatal_commit_error_ends_loop() {
        let broker = InMemoryBroker::new();
        seed(&broker, &["a"]).await;
        broker.fail_next_commit(BrokerError::Fatal("Local: Fatal error".to_string()));

        let handler = FailOn {
            offset: -1,
            rejected: false,
            calls: AtomicU32::new(0),
        };
        let consumer = SubscriberLoop::new(
            handler,
            fast_config(),
            FailurePolicy::Halt { max_attempts: 1 },
        );
        let (_shutdown, stop) = crate::Shutdown::new();

        let result = tokio::time::timeout(
            Duration::from_millis(500),
            consumer.run(subscribe(&broker).await, stop),
        )
        .await
        .expect("loop should stop on a fatal commit error");

        assert!(matches!(
            result,
            Err(SubscriberError::Broker(BrokerError::Fatal(_)))
        ));
        assert_eq!(consumer.handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.committed_offset(&group(), &topic(), 0), None);
    }
}
