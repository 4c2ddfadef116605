use buzzline::{BuzzlineConfig, SetupError};
use event_stream::StartPolicy;
use serial_test::serial;
use std::time::Duration;

const VARS: [&str; 8] = [
    "KAFKA_BROKER_ADDRESS",
    "KAFKA_TOPIC",
    "KAFKA_CONSUMER_GROUP_ID",
    "MESSAGE_INTERVAL_SECONDS",
    "KAFKA_DEAD_LETTER_TOPIC",
    "CONSUMER_START_POLICY",
    "MAX_BATCH_SIZE",
    "PUBLISH_MAX_ATTEMPTS",
];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_defaults_without_environment() {
    clear_env();

    let config = BuzzlineConfig::from_env().unwrap();

    assert_eq!(config.kafka_broker_address, "localhost:9092");
    assert_eq!(config.kafka_topic, "buzzline");
    assert_eq!(config.kafka_consumer_group_id, "default_group");
    assert_eq!(config.message_interval(), Duration::from_secs(1));
    assert_eq!(config.publish_max_attempts, 5);
    assert_eq!(config.handler_max_attempts, 3);
    assert_eq!(config.max_batch_size, 100);
    assert!(config.dead_letter_topic().unwrap().is_none());
}

#[test]
#[serial]
fn test_environment_overrides_defaults() {
    clear_env();
    std::env::set_var("KAFKA_BROKER_ADDRESS", "kafka-1:9092,kafka-2:9092");
    std::env::set_var("KAFKA_TOPIC", "buzz.events");
    std::env::set_var("MESSAGE_INTERVAL_SECONDS", "5");
    std::env::set_var("CONSUMER_START_POLICY", "42");
    std::env::set_var("KAFKA_DEAD_LETTER_TOPIC", "buzz.events.dlq");

    let config = BuzzlineConfig::from_env().unwrap();
    clear_env();

    assert_eq!(config.kafka_broker_address, "kafka-1:9092,kafka-2:9092");
    assert_eq!(config.topic().unwrap().as_str(), "buzz.events");
    assert_eq!(config.message_interval(), Duration::from_secs(5));
    assert_eq!(config.start_policy().unwrap(), StartPolicy::FromOffset(42));
    assert_eq!(
        config.dead_letter_topic().unwrap().unwrap().as_str(),
        "buzz.events.dlq"
    );
}

#[test]
#[serial]
fn test_blank_dead_letter_topic_means_halt() {
    clear_env();
    std::env::set_var("KAFKA_DEAD_LETTER_TOPIC", "  ");

    let config = BuzzlineConfig::from_env().unwrap();
    clear_env();

    assert!(config.kafka_dead_letter_topic.is_none());
}

#[test]
#[serial]
fn test_invalid_topic_is_a_config_error() {
    clear_env();
    std::env::set_var("KAFKA_TOPIC", "not a topic");

    let result = BuzzlineConfig::from_env();
    clear_env();

    assert!(matches!(result, Err(SetupError::Config(_))));
}

#[test]
#[serial]
fn test_unparseable_number_is_a_config_error() {
    clear_env();
    std::env::set_var("MAX_BATCH_SIZE", "lots");

    let result = BuzzlineConfig::from_env();
    clear_env();

    assert!(matches!(result, Err(SetupError::Config(_))));
}

#[test]
#[serial]
fn test_zero_publish_attempts_rejected() {
    clear_env();
    std::env::set_var("PUBLISH_MAX_ATTEMPTS", "0");

    let result = BuzzlineConfig::from_env();
    clear_env();

    assert!(matches!(result, Err(SetupError::Config(_))));
}
