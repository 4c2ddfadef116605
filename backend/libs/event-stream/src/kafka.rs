//! rdkafka-backed transports.

use crate::error::{BrokerError, PublishError, TopicError};
use crate::model::{CommitOffset, GroupId, Message, OutboundRecord, StartPolicy, TopicName, TopicSpec};
use crate::transport::{ConsumerTransport, Delivery, ProducerTransport, TopicStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Connection settings shared by producer and consumer transports.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Comma-separated `host:port` list
    pub brokers: String,
    pub client_id: String,
    /// Bound on the initial metadata round-trip
    pub connection_timeout: Duration,
    /// librdkafka delivery timeout for one send
    pub message_timeout: Duration,
    pub session_timeout: Duration,
}

impl KafkaSettings {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            client_id: "buzzline".to_string(),
            connection_timeout: Duration::from_secs(10),
            message_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(10),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id)
            .set(
                "socket.connection.setup.timeout.ms",
                self.connection_timeout.as_millis().to_string(),
            );
        config
    }
}

/// How a broker error code should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Authorization,
    Fatal,
}

pub fn classify(code: RDKafkaErrorCode) -> ErrorClass {
    use RDKafkaErrorCode::*;

    match code {
        MessageTimedOut
        | QueueFull
        | RequestTimedOut
        | OperationTimedOut
        | LeaderNotAvailable
        | NotLeaderForPartition
        | BrokerNotAvailable
        | NetworkException
        | AllBrokersDown
        | BrokerTransportFailure
        | NotEnoughReplicas
        | NotEnoughReplicasAfterAppend
        | UnknownTopicOrPartition
        | CoordinatorLoadInProgress
        | CoordinatorNotAvailable
        | NotCoordinator
        | RebalanceInProgress => ErrorClass::Transient,
        TopicAuthorizationFailed
        | GroupAuthorizationFailed
        | ClusterAuthorizationFailed
        | SaslAuthenticationFailed
        | Authentication => ErrorClass::Authorization,
        _ => ErrorClass::Fatal,
    }
}

fn classify_error(error: &KafkaError) -> ErrorClass {
    error
        .rdkafka_error_code()
        .map(classify)
        .unwrap_or(ErrorClass::Fatal)
}

fn publish_error(topic: &TopicName, error: &KafkaError) -> PublishError {
    match classify_error(error) {
        ErrorClass::Transient => PublishError::transient(topic.as_str(), error.to_string()),
        ErrorClass::Authorization | ErrorClass::Fatal => {
            PublishError::fatal(topic.as_str(), error.to_string())
        }
    }
}

fn broker_error(error: &KafkaError) -> BrokerError {
    match classify_error(error) {
        ErrorClass::Transient => BrokerError::Transient(error.to_string()),
        ErrorClass::Authorization => BrokerError::Authorization(error.to_string()),
        ErrorClass::Fatal => BrokerError::Fatal(error.to_string()),
    }
}

/// Fetch cluster metadata to prove the brokers answer.
async fn verify_brokers<C>(client: Arc<C>, timeout: Duration) -> Result<usize, String>
where
    C: MetadataSource + Send + Sync + 'static,
{
    tokio::task::spawn_blocking(move || client.broker_count(timeout))
        .await
        .map_err(|e| format!("metadata task failed: {}", e))?
}

trait MetadataSource {
    fn broker_count(&self, timeout: Duration) -> Result<usize, String>;
}

impl MetadataSource for FutureProducer {
    fn broker_count(&self, timeout: Duration) -> Result<usize, String> {
        let metadata = self
            .client()
            .fetch_metadata(None, timeout)
            .map_err(|e| e.to_string())?;
        Ok(metadata.brokers().len())
    }
}

impl MetadataSource for StreamConsumer {
    fn broker_count(&self, timeout: Duration) -> Result<usize, String> {
        let metadata = self
            .fetch_metadata(None, timeout)
            .map_err(|e| e.to_string())?;
        Ok(metadata.brokers().len())
    }
}

/// Producer transport: idempotent `FutureProducer` plus an admin client for topic creation.
pub struct KafkaProducerTransport {
    producer: Arc<FutureProducer>,
    admin: AdminClient<DefaultClientContext>,
    settings: KafkaSettings,
}

impl KafkaProducerTransport {
    /// Create the clients and verify the brokers are reachable.
    pub async fn connect(settings: KafkaSettings) -> Result<Self, BrokerError> {
        let producer: FutureProducer = settings
            .client_config()
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set(
                "message.timeout.ms",
                settings.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| BrokerError::Connection(format!("Failed to create producer: {}", e)))?;

        let admin: AdminClient<DefaultClientContext> = settings
            .client_config()
            .create()
            .map_err(|e| BrokerError::Connection(format!("Failed to create admin client: {}", e)))?;

        let producer = Arc::new(producer);
        let brokers = verify_brokers(producer.clone(), settings.connection_timeout)
            .await
            .map_err(|e| {
                BrokerError::Connection(format!("Kafka at {} is unreachable: {}", settings.brokers, e))
            })?;
        if brokers == 0 {
            return Err(BrokerError::Connection(format!(
                "No Kafka brokers available at {}",
                settings.brokers
            )));
        }

        info!(brokers = %settings.brokers, available = brokers, "Kafka producer connected");

        Ok(Self {
            producer,
            admin,
            settings,
        })
    }
}

#[async_trait]
impl ProducerTransport for KafkaProducerTransport {
    async fn ensure_topic(
        &self,
        topic: &TopicName,
        spec: TopicSpec,
    ) -> Result<TopicStatus, TopicError> {
        let new_topic = NewTopic::new(
            topic.as_str(),
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        let options = AdminOptions::new()
            .operation_timeout(Some(resilience::admin_config().timeout.duration));

        let results = self
            .admin
            .create_topics(&[new_topic], &options)
            .await
            .map_err(|e| TopicError::BrokerUnavailable {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let mut status = TopicStatus::Created;
        for result in results {
            match result {
                Ok(_) => {}
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    status = TopicStatus::AlreadyExists;
                }
                Err((name, RDKafkaErrorCode::InvalidTopic)) => {
                    return Err(TopicError::InvalidName {
                        name,
                        reason: "rejected by broker".to_string(),
                    });
                }
                Err((_, code)) if classify(code) == ErrorClass::Authorization => {
                    return Err(TopicError::PermissionDenied {
                        topic: topic.to_string(),
                    });
                }
                Err((_, code)) => {
                    return Err(TopicError::BrokerUnavailable {
                        topic: topic.to_string(),
                        reason: code.to_string(),
                    });
                }
            }
        }

        Ok(status)
    }

    async fn send(&self, record: &OutboundRecord) -> Result<Delivery, PublishError> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let mut kafka_record = FutureRecord::<[u8], [u8]>::to(record.topic.as_str())
            .payload(record.payload.as_slice())
            .headers(headers);
        if let Some(key) = &record.key {
            kafka_record = kafka_record.key(key.as_slice());
        }

        match self
            .producer
            .send(kafka_record, Timeout::After(self.settings.message_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(Delivery { partition, offset }),
            Err((e, _)) => Err(publish_error(&record.topic, &e)),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| PublishError::fatal("flush", e.to_string()))?
            .map_err(|e| PublishError::transient("flush", e.to_string()))
    }
}

/// Consumer transport on a `StreamConsumer` with auto-commit disabled.
pub struct KafkaConsumerTransport {
    settings: KafkaSettings,
    consumer: Option<Arc<StreamConsumer>>,
    start: StartPolicy,
    /// Partitions already checked for a committed offset (FromOffset only)
    positioned: HashMap<i32, bool>,
}

impl KafkaConsumerTransport {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            consumer: None,
            start: StartPolicy::default(),
            positioned: HashMap::new(),
        }
    }

    fn consumer(&self) -> Result<Arc<StreamConsumer>, BrokerError> {
        self.consumer
            .clone()
            .ok_or_else(|| BrokerError::Fatal("consumer is not subscribed".to_string()))
    }

    /// With `FromOffset(n)`, a partition without a committed offset starts at `n`.
    /// librdkafka starts such partitions at the earliest offset, so earlier
    /// messages are skipped here.
    async fn should_skip(&mut self, message: &Message) -> Result<bool, BrokerError> {
        let StartPolicy::FromOffset(start) = self.start else {
            return Ok(false);
        };
        if message.offset >= start {
            self.positioned.insert(message.partition, true);
            return Ok(false);
        }

        let from_start = match self.positioned.get(&message.partition) {
            Some(from_start) => *from_start,
            None => {
                let has_commit = self.has_committed_offset(message).await?;
                self.positioned.insert(message.partition, !has_commit);
                !has_commit
            }
        };
        Ok(from_start)
    }

    async fn has_committed_offset(&self, message: &Message) -> Result<bool, BrokerError> {
        let consumer = self.consumer()?;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(message.topic.as_str(), message.partition);
        let timeout = self.settings.session_timeout;

        let committed = tokio::task::spawn_blocking(move || consumer.committed_offsets(tpl, timeout))
            .await
            .map_err(|e| BrokerError::Fatal(e.to_string()))?
            .map_err(|e| broker_error(&e))?;

        Ok(committed
            .elements()
            .iter()
            .any(|element| matches!(element.offset(), Offset::Offset(_))))
    }
}

fn to_message(borrowed: &BorrowedMessage<'_>) -> Result<Message, BrokerError> {
    use rdkafka::Message as _;

    let topic = TopicName::new(borrowed.topic())
        .map_err(|e| BrokerError::Fatal(e.to_string()))?;

    let mut headers = BTreeMap::new();
    if let Some(raw) = borrowed.headers() {
        for header in raw.iter() {
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            headers.insert(header.key.to_string(), value);
        }
    }

    let timestamp = borrowed
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(Message {
        topic,
        partition: borrowed.partition(),
        offset: borrowed.offset(),
        key: borrowed.key().map(<[u8]>::to_vec),
        payload: borrowed.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp,
        headers,
    })
}

#[async_trait]
impl ConsumerTransport for KafkaConsumerTransport {
    async fn subscribe(
        &mut self,
        topic: &TopicName,
        group: &GroupId,
        start: StartPolicy,
    ) -> Result<(), BrokerError> {
        let reset = match start {
            StartPolicy::Latest => "latest",
            StartPolicy::Earliest | StartPolicy::FromOffset(_) => "earliest",
        };

        let consumer: StreamConsumer = self
            .settings
            .client_config()
            .set("group.id", group.as_str())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", reset)
            .set(
                "session.timeout.ms",
                self.settings.session_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| BrokerError::Connection(format!("Failed to create consumer: {}", e)))?;

        let consumer = Arc::new(consumer);
        verify_brokers(consumer.clone(), self.settings.connection_timeout)
            .await
            .map_err(|e| {
                BrokerError::Connection(format!(
                    "Kafka at {} is unreachable: {}",
                    self.settings.brokers, e
                ))
            })?;

        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| broker_error(&e))?;

        info!(topic = %topic, group = %group, auto_offset_reset = reset, "Kafka consumer subscribed");

        self.consumer = Some(consumer);
        self.start = start;
        self.positioned.clear();
        Ok(())
    }

    async fn fetch(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, BrokerError> {
        let consumer = self.consumer()?;
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();

        while batch.len() < max_messages {
            // Once something arrived, only drain what is already buffered.
            let wait = if batch.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::from_millis(1)
            };

            let received = match tokio::time::timeout(wait, consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(borrowed)) => to_message(&borrowed),
                Ok(Err(e)) if batch.is_empty() => return Err(broker_error(&e)),
                Ok(Err(e)) => {
                    warn!(error = %e, "Receive failed after partial batch");
                    break;
                }
            };

            let message = received?;
            if self.should_skip(&message).await? {
                debug!(
                    partition = message.partition,
                    offset = message.offset,
                    "Skipping message before configured start offset"
                );
                continue;
            }
            batch.push(message);
        }

        Ok(batch)
    }

    async fn commit(&mut self, offsets: &[CommitOffset]) -> Result<(), BrokerError> {
        let consumer = self.consumer()?;
        let mut tpl = TopicPartitionList::new();
        for commit in offsets {
            // Kafka stores the next offset to read
            tpl.add_partition_offset(
                commit.partition.topic.as_str(),
                commit.partition.partition,
                Offset::Offset(commit.offset + 1),
            )
            .map_err(|e| broker_error(&e))?;
        }

        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Fatal(e.to_string()))?
            .map_err(|e| broker_error(&e))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
        self.positioned.clear();
        Ok(())
    }
}
