//! Round trip against a real broker.
//!
//! Run with `KAFKA_BROKER_ADDRESS=localhost:9092 cargo test -- --ignored`.

use async_trait::async_trait;
use event_stream::{
    FailurePolicy, GroupId, HandlerError, KafkaConsumerTransport, KafkaProducerTransport,
    KafkaSettings, Message, MessageHandler, Publisher, PublisherConfig, Shutdown, StartPolicy,
    SubscriberConfig, SubscriberLoop, Subscription, TopicName,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

fn settings() -> KafkaSettings {
    let brokers =
        std::env::var("KAFKA_BROKER_ADDRESS").unwrap_or_else(|_| "localhost:9092".to_string());
    KafkaSettings::new(brokers)
}

#[derive(Default)]
struct Collect {
    payloads: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageHandler for Collect {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.payloads
            .lock()
            .unwrap()
            .push(message.payload_lossy().into_owned());
        Ok(())
    }
}

#[tokio::test]
#[ignore = "Requires Kafka broker"]
async fn test_kafka_publish_then_consume() {
    let topic = TopicName::new(format!("buzzline-it-{}", Uuid::new_v4())).unwrap();
    let group = GroupId::new(format!("buzzline-it-{}", Uuid::new_v4()));

    let producer = KafkaProducerTransport::connect(settings()).await.unwrap();
    let publisher = Publisher::new(producer, PublisherConfig::default());
    publisher.ensure_topic(&topic).await.unwrap();
    for payload in ["one", "two", "three"] {
        publisher.publish(&topic, payload, None).await.unwrap();
    }
    publisher.close().await.unwrap();

    let config = SubscriberConfig::default();
    let subscription = Subscription::subscribe(
        KafkaConsumerTransport::new(settings()),
        topic,
        group,
        StartPolicy::Earliest,
        config.max_batch_size,
    )
    .await
    .unwrap();

    let handler = Arc::new(Collect::default());
    let consumer = SubscriberLoop::new(
        handler.clone(),
        config,
        FailurePolicy::Halt { max_attempts: 3 },
    );
    let (shutdown, stop) = Shutdown::new();
    let task = tokio::spawn(async move { consumer.run(subscription, stop).await });

    for _ in 0..300 {
        if handler.payloads.lock().unwrap().len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    shutdown.trigger();
    task.await.unwrap().unwrap();

    assert_eq!(*handler.payloads.lock().unwrap(), vec!["one", "two", "three"]);
}
