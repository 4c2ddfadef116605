//! Producer process: ensure the topic, then publish one buzz per interval.

use crate::config::BuzzlineConfig;
use crate::error::{AppError, SetupError};
use event_stream::{
    PayloadSource, ProducerTransport, PublishLoopReport, Publisher, StreamMetrics,
};
use tokio::sync::watch;
use tracing::{error, info};

/// Run the producer loop until `stop` fires, the source runs dry, or a publish fails fatally.
pub async fn run_producer<T, S>(
    config: &BuzzlineConfig,
    transport: T,
    source: &mut S,
    stop: watch::Receiver<bool>,
) -> Result<PublishLoopReport, AppError>
where
    T: ProducerTransport,
    S: PayloadSource,
{
    let topic = config.topic()?;
    info!(
        topic = %topic,
        interval_secs = config.message_interval_seconds,
        "Producer configuration loaded"
    );

    let metrics = StreamMetrics::new("buzzline-producer")
        .map_err(|e| SetupError::Config(format!("Failed to create metrics: {}", e)))?;
    let publisher = Publisher::new(transport, config.publisher_config()).with_metrics(metrics);

    if let Err(e) = publisher.ensure_topic(&topic).await {
        error!(topic = %topic, error = %e, "Failed to create or verify topic");
        if let Err(flush) = publisher.close().await {
            error!(error = %flush, "Flush after topic failure also failed");
        }
        return Err(SetupError::from(e).into());
    }
    info!(topic = %topic, "Kafka topic is ready");

    let report = publisher
        .run(&topic, config.message_interval(), source, stop)
        .await?;

    Ok(report)
}
