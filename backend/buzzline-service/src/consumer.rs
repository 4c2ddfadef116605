//! Consumer process: join the group and handle buzzes until stopped.

use crate::config::BuzzlineConfig;
use crate::error::{AppError, SetupError};
use event_stream::{
    ConsumeReport, ConsumerTransport, DeadLetterSink, MessageHandler, ProducerTransport,
    Publisher, StreamMetrics, SubscriberLoop, Subscription, TopicDeadLetterSink,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Build the dead-letter sink when a dead-letter topic is configured.
///
/// The topic is created up front so a misconfigured topic fails at startup
/// instead of on the first poison message.
pub async fn dead_letter_sink<P>(
    config: &BuzzlineConfig,
    transport: P,
) -> Result<Option<Arc<dyn DeadLetterSink>>, SetupError>
where
    P: ProducerTransport + 'static,
{
    let Some(topic) = config.dead_letter_topic()? else {
        return Ok(None);
    };

    let publisher = Publisher::new(transport, config.publisher_config());
    publisher.ensure_topic(&topic).await?;
    info!(dlq_topic = %topic, "Dead-letter topic is ready");

    Ok(Some(Arc::new(TopicDeadLetterSink::new(publisher, topic))))
}

/// Subscribe and run the handling loop until `stop` fires or a message halts it.
///
/// The dead-letter sink, if any, is flushed and closed on every exit path.
pub async fn run_consumer<C, H>(
    config: &BuzzlineConfig,
    transport: C,
    handler: H,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    stop: watch::Receiver<bool>,
) -> Result<ConsumeReport, AppError>
where
    C: ConsumerTransport,
    H: MessageHandler,
{
    let sink = dead_letter.clone();
    let result = consume(config, transport, handler, dead_letter, stop).await;

    if let Some(sink) = sink {
        match sink.close().await {
            Ok(()) => info!("Dead-letter producer closed"),
            Err(e) => warn!(error = %e, "Dead-letter producer flush failed"),
        }
    }

    result
}

async fn consume<C, H>(
    config: &BuzzlineConfig,
    transport: C,
    handler: H,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    stop: watch::Receiver<bool>,
) -> Result<ConsumeReport, AppError>
where
    C: ConsumerTransport,
    H: MessageHandler,
{
    let topic = config.topic()?;
    let group = config.group_id();
    let start = config.start_policy()?;
    let subscriber_config = config.subscriber_config();

    info!(topic = %topic, group = %group, "Consumer configuration loaded");

    let subscription = Subscription::subscribe(
        transport,
        topic,
        group,
        start,
        subscriber_config.max_batch_size,
    )
    .await?;

    let policy = config.failure_policy(dead_letter);
    info!(policy = ?policy, "Handler failure policy");

    let metrics = StreamMetrics::new("buzzline-consumer")
        .map_err(|e| SetupError::Config(format!("Failed to create metrics: {}", e)))?;
    let consumer = SubscriberLoop::new(handler, subscriber_config, policy).with_metrics(metrics);

    Ok(consumer.run(subscription, stop).await?)
}
