//! In-process broker for tests and local demos.
//!
//! Topics are partitioned append-only logs. Committed offsets are stored per
//! consumer group and survive consumer handles being dropped, so a new
//! consumer in the same group resumes after the last commit the way a
//! restarted process does against Kafka. Failures can be injected per call.

use crate::error::{BrokerError, PublishError, TopicError};
use crate::model::{
    CommitOffset, GroupId, Message, OutboundRecord, StartPolicy, TopicName, TopicSpec,
};
use crate::transport::{ConsumerTransport, Delivery, ProducerTransport, TopicStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

const FETCH_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Default)]
struct BrokerState {
    topics: HashMap<TopicName, Vec<Vec<Message>>>,
    committed: HashMap<(GroupId, TopicName, i32), i64>,
    round_robin: usize,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    unavailable: bool,
    denied_topics: HashSet<String>,
    send_failures: VecDeque<PublishError>,
    lost_acks: usize,
    fetch_failures: VecDeque<BrokerError>,
    commit_failures: VecDeque<BrokerError>,
}

/// Shared handle to one in-process broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
        }
    }

    pub fn consumer(&self) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            subscription: None,
            positions: HashMap::new(),
            start: StartPolicy::default(),
        }
    }

    pub fn topic_exists(&self, topic: &TopicName) -> bool {
        self.lock().topics.contains_key(topic)
    }

    pub fn partition_count(&self, topic: &TopicName) -> Option<usize> {
        self.lock().topics.get(topic).map(Vec::len)
    }

    /// Every message on `topic`, partition by partition in offset order.
    pub fn messages(&self, topic: &TopicName) -> Vec<Message> {
        self.lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Last handled offset the group committed for `partition`.
    pub fn committed_offset(&self, group: &GroupId, topic: &TopicName, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.clone(), topic.clone(), partition))
            .copied()
    }

    /// Make every connection and admin call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().faults.unavailable = unavailable;
    }

    /// Refuse topic creation for `topic`.
    pub fn deny_topic(&self, topic: &str) {
        self.lock().faults.denied_topics.insert(topic.to_string());
    }

    /// Return these errors from the next sends, in order, without appending.
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = PublishError>) {
        self.lock().faults.send_failures.extend(errors);
    }

    /// Append the next `count` sends but report a timeout to the producer.
    pub fn lose_next_acks(&self, count: usize) {
        self.lock().faults.lost_acks += count;
    }

    pub fn fail_next_fetch(&self, error: BrokerError) {
        self.lock().faults.fetch_failures.push_back(error);
    }

    pub fn fail_next_commit(&self, error: BrokerError) {
        self.lock().faults.commit_failures.push_back(error);
    }
}

/// Producer handle on an `InMemoryBroker`.
pub struct MemoryProducer {
    broker: InMemoryBroker,
}

#[async_trait]
impl ProducerTransport for MemoryProducer {
    async fn ensure_topic(
        &self,
        topic: &TopicName,
        spec: TopicSpec,
    ) -> Result<TopicStatus, TopicError> {
        let mut state = self.broker.lock();

        if state.faults.unavailable {
            return Err(TopicError::BrokerUnavailable {
                topic: topic.to_string(),
                reason: "broker unreachable".to_string(),
            });
        }
        if state.faults.denied_topics.contains(topic.as_str()) {
            return Err(TopicError::PermissionDenied {
                topic: topic.to_string(),
            });
        }
        if state.topics.contains_key(topic) {
            return Ok(TopicStatus::AlreadyExists);
        }

        let partitions = spec.partitions.max(1) as usize;
        state.topics.insert(topic.clone(), vec![Vec::new(); partitions]);
        Ok(TopicStatus::Created)
    }

    async fn send(&self, record: &OutboundRecord) -> Result<Delivery, PublishError> {
        let mut state = self.broker.lock();

        if state.faults.unavailable {
            return Err(PublishError::transient(record.topic.as_str(), "broker unreachable"));
        }
        if let Some(error) = state.faults.send_failures.pop_front() {
            return Err(error);
        }

        let partition_count = match state.topics.get(&record.topic) {
            Some(partitions) => partitions.len(),
            None => {
                return Err(PublishError::fatal(
                    record.topic.as_str(),
                    "unknown topic or partition",
                ))
            }
        };

        let partition = match &record.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % partition_count as u64) as usize
            }
            None => {
                state.round_robin = state.round_robin.wrapping_add(1);
                state.round_robin % partition_count
            }
        };

        let lost_ack = state.faults.lost_acks > 0;
        if lost_ack {
            state.faults.lost_acks -= 1;
        }

        let log = state
            .topics
            .get_mut(&record.topic)
            .map(|partitions| &mut partitions[partition]);
        let Some(log) = log else {
            return Err(PublishError::fatal(record.topic.as_str(), "unknown topic or partition"));
        };

        let offset = log.len() as i64;
        log.push(Message {
            topic: record.topic.clone(),
            partition: partition as i32,
            offset,
            key: record.key.clone(),
            payload: record.payload.clone(),
            timestamp: Utc::now(),
            headers: record.headers.clone(),
        });

        if lost_ack {
            return Err(PublishError::transient(
                record.topic.as_str(),
                "request timed out waiting for acknowledgement",
            ));
        }

        Ok(Delivery {
            partition: partition as i32,
            offset,
        })
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Consumer handle on an `InMemoryBroker`. One handle is one group member.
pub struct MemoryConsumer {
    broker: InMemoryBroker,
    subscription: Option<(TopicName, GroupId)>,
    /// Next offset to deliver, per partition
    positions: HashMap<i32, i64>,
    start: StartPolicy,
}

impl MemoryConsumer {
    fn start_position(
        state: &BrokerState,
        topic: &TopicName,
        group: &GroupId,
        partition: i32,
        start: StartPolicy,
        log_len: i64,
    ) -> i64 {
        if let Some(committed) = state
            .committed
            .get(&(group.clone(), topic.clone(), partition))
        {
            return committed + 1;
        }

        match start {
            StartPolicy::Earliest => 0,
            StartPolicy::Latest => log_len,
            // Offsets below `n` are never delivered, even if published later
            StartPolicy::FromOffset(offset) => offset.max(0),
        }
    }
}

#[async_trait]
impl ConsumerTransport for MemoryConsumer {
    async fn subscribe(
        &mut self,
        topic: &TopicName,
        group: &GroupId,
        start: StartPolicy,
    ) -> Result<(), BrokerError> {
        let state = self.broker.lock();

        if state.faults.unavailable {
            return Err(BrokerError::Connection("broker unreachable".to_string()));
        }

        self.positions.clear();
        if let Some(partitions) = state.topics.get(topic) {
            for (partition, log) in partitions.iter().enumerate() {
                let partition = partition as i32;
                let position =
                    Self::start_position(&state, topic, group, partition, start, log.len() as i64);
                self.positions.insert(partition, position);
            }
        }
        drop(state);

        self.start = start;
        self.subscription = Some((topic.clone(), group.clone()));
        Ok(())
    }

    async fn fetch(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, BrokerError> {
        let Some((topic, group)) = self.subscription.clone() else {
            return Err(BrokerError::Fatal("consumer is not subscribed".to_string()));
        };
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut state = self.broker.lock();

                if state.faults.unavailable {
                    return Err(BrokerError::Transient("broker unreachable".to_string()));
                }
                if let Some(error) = state.faults.fetch_failures.pop_front() {
                    return Err(error);
                }

                let mut batch = Vec::new();
                if let Some(partitions) = state.topics.get(&topic) {
                    for (partition, log) in partitions.iter().enumerate() {
                        let partition = partition as i32;
                        let position = *self.positions.entry(partition).or_insert_with(|| {
                            Self::start_position(
                                &state,
                                &topic,
                                &group,
                                partition,
                                self.start,
                                0,
                            )
                        });

                        let available = log.iter().skip(position.max(0) as usize);
                        for message in available.take(max_messages - batch.len()) {
                            batch.push(message.clone());
                        }
                        if let Some(last) = batch.iter().rev().find(|m| m.partition == partition) {
                            self.positions.insert(partition, last.offset + 1);
                        }
                        if batch.len() >= max_messages {
                            break;
                        }
                    }
                }
                drop(state);

                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(FETCH_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }
    }

    async fn commit(&mut self, offsets: &[CommitOffset]) -> Result<(), BrokerError> {
        let Some((_, group)) = self.subscription.clone() else {
            return Err(BrokerError::Fatal("consumer is not subscribed".to_string()));
        };
        let mut state = self.broker.lock();

        if state.faults.unavailable {
            return Err(BrokerError::Transient("broker unreachable".to_string()));
        }
        if let Some(error) = state.faults.commit_failures.pop_front() {
            return Err(error);
        }

        for commit in offsets {
            state.committed.insert(
                (
                    group.clone(),
                    commit.partition.topic.clone(),
                    commit.partition.partition,
                ),
                commit.offset,
            );
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.subscription = None;
        self.positions.clear();
        Ok(())
    }
}
