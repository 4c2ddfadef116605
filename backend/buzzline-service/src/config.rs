//! Runtime configuration, read from the environment (and `.env`).

use crate::error::SetupError;
use event_stream::{
    FailurePolicy, GroupId, KafkaSettings, PublisherConfig, StartPolicy, SubscriberConfig,
    TopicName, TopicSpec,
};
use resilience::RetryConfig;
use serde::Deserialize;
use std::time::Duration;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BuzzlineConfig {
    /// Bootstrap servers
    #[validate(length(min = 1))]
    pub kafka_broker_address: String,

    #[validate(custom(function = "validate_topic"))]
    pub kafka_topic: String,

    #[validate(length(min = 1))]
    pub kafka_consumer_group_id: String,

    /// Seconds between produced messages
    #[validate(range(min = 1))]
    pub message_interval_seconds: u64,

    #[validate(range(min = 1))]
    pub kafka_topic_partitions: i32,

    #[validate(range(min = 1))]
    pub kafka_replication_factor: i32,

    #[validate(range(min = 1, max = 20))]
    pub publish_max_attempts: u32,

    #[validate(range(min = 1, max = 20))]
    pub handler_max_attempts: u32,

    /// Dead-letter topic; without one a failing message halts the consumer
    #[validate(custom(function = "validate_topic"))]
    pub kafka_dead_letter_topic: Option<String>,

    #[validate(custom(function = "validate_start_policy"))]
    pub consumer_start_policy: String,

    #[validate(range(min = 1))]
    pub poll_timeout_ms: u64,

    #[validate(range(min = 1, max = 10000))]
    pub max_batch_size: usize,
}

fn validate_topic(name: &str) -> Result<(), ValidationError> {
    TopicName::new(name).map(|_| ()).map_err(|e| {
        let mut error = ValidationError::new("topic_name");
        error.message = Some(e.to_string().into());
        error
    })
}

fn validate_start_policy(policy: &str) -> Result<(), ValidationError> {
    policy.parse::<StartPolicy>().map(|_| ()).map_err(|e| {
        let mut error = ValidationError::new("start_policy");
        error.message = Some(e.into());
        error
    })
}

impl BuzzlineConfig {
    /// Load defaults, then `.env`, then the process environment.
    pub fn from_env() -> Result<Self, SetupError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("kafka_broker_address", "localhost:9092")?
            .set_default("kafka_topic", "buzzline")?
            .set_default("kafka_consumer_group_id", "default_group")?
            .set_default("message_interval_seconds", 1)?
            .set_default("kafka_topic_partitions", 1)?
            .set_default("kafka_replication_factor", 1)?
            .set_default("publish_max_attempts", 5)?
            .set_default("handler_max_attempts", 3)?
            .set_default("consumer_start_policy", "earliest")?
            .set_default("poll_timeout_ms", 1000)?
            .set_default("max_batch_size", 100)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let mut loaded: BuzzlineConfig = config.try_deserialize()?;
        if loaded
            .kafka_dead_letter_topic
            .as_deref()
            .is_some_and(|topic| topic.trim().is_empty())
        {
            loaded.kafka_dead_letter_topic = None;
        }

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn topic(&self) -> Result<TopicName, SetupError> {
        Ok(TopicName::new(&self.kafka_topic)?)
    }

    pub fn dead_letter_topic(&self) -> Result<Option<TopicName>, SetupError> {
        self.kafka_dead_letter_topic
            .as_deref()
            .map(TopicName::new)
            .transpose()
            .map_err(Into::into)
    }

    pub fn group_id(&self) -> GroupId {
        GroupId::new(&self.kafka_consumer_group_id)
    }

    pub fn start_policy(&self) -> Result<StartPolicy, SetupError> {
        self.consumer_start_policy
            .parse()
            .map_err(SetupError::Config)
    }

    pub fn message_interval(&self) -> Duration {
        Duration::from_secs(self.message_interval_seconds)
    }

    pub fn kafka_settings(&self) -> KafkaSettings {
        KafkaSettings::new(&self.kafka_broker_address)
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            retry: RetryConfig {
                max_attempts: self.publish_max_attempts,
                ..RetryConfig::default()
            },
            topic_spec: TopicSpec {
                partitions: self.kafka_topic_partitions,
                replication_factor: self.kafka_replication_factor,
            },
            ..PublisherConfig::default()
        }
    }

    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            max_batch_size: self.max_batch_size,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            ..SubscriberConfig::default()
        }
    }

    /// Halt unless a dead-letter sink is supplied.
    pub fn failure_policy(
        &self,
        dead_letter: Option<std::sync::Arc<dyn event_stream::DeadLetterSink>>,
    ) -> FailurePolicy {
        match dead_letter {
            Some(sink) => FailurePolicy::DeadLetter {
                max_attempts: self.handler_max_attempts,
                sink,
            },
            None => FailurePolicy::Halt {
                max_attempts: self.handler_max_attempts,
            },
        }
    }
}

impl Default for BuzzlineConfig {
    fn default() -> Self {
        Self {
            kafka_broker_address: "localhost:9092".to_string(),
            kafka_topic: "buzzline".to_string(),
            kafka_consumer_group_id: "default_group".to_string(),
            message_interval_seconds: 1,
            kafka_topic_partitions: 1,
            kafka_replication_factor: 1,
            publish_max_attempts: 5,
            handler_max_attempts: 3,
            kafka_dead_letter_topic: None,
            consumer_start_policy: "earliest".to_string(),
            poll_timeout_ms: 1000,
            max_batch_size: 100,
        }
    }
}
