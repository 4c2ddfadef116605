//! # Event Stream
//!
//! Reliable publish and consume on a partitioned, offset-addressed log.
//!
//! ## Guarantees
//!
//! - **Publish is at-least-once.** `Publisher::publish` retries transient
//!   failures with exponential backoff and returns `Ok` only after the broker
//!   acknowledged the record. Retries can append duplicates; each record
//!   carries a `message_id` header that is identical across retries.
//! - **Consume is at-least-once.** `SubscriberLoop` commits an offset only
//!   after the handler returned `Ok` for that message (or after it was routed
//!   to the dead-letter sink). A crash between handling and committing
//!   redelivers the message, so handlers must be idempotent.
//! - **Per-partition order.** Messages reach the handler in offset order
//!   within a partition. There is no ordering across partitions.
//! - **Committed offsets name the last handled message.** `commit` refuses
//!   offsets past the last delivered message and offsets behind the current
//!   cursor.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_stream::memory::InMemoryBroker;
//! use event_stream::{
//!     FailurePolicy, GroupId, HandlerError, Message, MessageHandler, Publisher, PublisherConfig,
//!     Shutdown, StartPolicy, SubscriberConfig, SubscriberLoop, Subscription, TopicName,
//! };
//!
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Print {
//!     async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
//!         println!("{}", message.payload_lossy());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let broker = InMemoryBroker::new();
//! let topic = TopicName::new("buzzline")?;
//!
//! let publisher = Publisher::new(broker.producer(), PublisherConfig::default());
//! publisher.publish(&topic, "hello", None).await?;
//!
//! let config = SubscriberConfig::default();
//! let subscription = Subscription::subscribe(
//!     broker.consumer(),
//!     topic,
//!     GroupId::new("default_group"),
//!     StartPolicy::Earliest,
//!     config.max_batch_size,
//! )
//! .await?;
//!
//! let (shutdown, stop) = Shutdown::new();
//! let consumer = SubscriberLoop::new(Print, config, FailurePolicy::Halt { max_attempts: 3 });
//! let handle = tokio::spawn(async move { consumer.run(subscription, stop).await });
//! shutdown.trigger();
//! handle.await??;
//! # Ok(())
//! # }
//! ```

pub mod dead_letter;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod publisher;
pub mod shutdown;
pub mod state;
pub mod subscriber;
pub mod transport;

pub use dead_letter::{DeadLetterRecord, DeadLetterSink, TopicDeadLetterSink};
pub use error::{
    BrokerError, HandlerError, PublishError, PublishResult, SubscriberError, SubscriberResult,
    TopicError,
};
pub use kafka::{KafkaConsumerTransport, KafkaProducerTransport, KafkaSettings};
pub use metrics::StreamMetrics;
pub use model::{
    CommitOffset, GroupId, Message, OutboundRecord, PublishReceipt, StartPolicy, TopicName,
    TopicPartition, TopicSpec, MESSAGE_ID_HEADER, PRODUCED_AT_HEADER,
};
pub use publisher::{
    Payload, PayloadSource, PublishLoopReport, Publisher, PublisherConfig, StopReason,
};
pub use shutdown::Shutdown;
pub use state::SubscriptionState;
pub use subscriber::{
    Batch, ConsumeReport, ConsumeStopReason, FailurePolicy, MessageHandler, SubscriberConfig,
    SubscriberLoop, Subscription,
};
pub use transport::{ConsumerTransport, Delivery, ProducerTransport, TopicStatus};
