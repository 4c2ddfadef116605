//! Buzzline producer - publishes a random sentence to Kafka every interval.
//!
//! Environment variables:
//! - KAFKA_BROKER_ADDRESS: bootstrap servers (default: "localhost:9092")
//! - KAFKA_TOPIC: topic to publish to (default: "buzzline")
//! - MESSAGE_INTERVAL_SECONDS: seconds between messages (default: 1)
//! - KAFKA_TOPIC_PARTITIONS / KAFKA_REPLICATION_FACTOR: used if the topic is created
//! - PUBLISH_MAX_ATTEMPTS: send attempts before giving up (default: 5)
//!
//! Exit codes: 0 clean shutdown, 1 configuration or topic error,
//! 2 fatal publish error, 3 Kafka connection error.

use buzzline::error::{AppError, SetupError};
use buzzline::sentences::RandomSentences;
use buzzline::signal::spawn_signal_listener;
use buzzline::{logging, producer, BuzzlineConfig};
use event_stream::{KafkaProducerTransport, PublishLoopReport, Shutdown, StreamMetrics};
use std::process::ExitCode;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_tracing();
    info!("START producer");

    let outcome = run().await;
    match StreamMetrics::render() {
        Ok(text) => debug!(metrics = %text, "Final stream metrics"),
        Err(e) => debug!(error = %e, "Could not render stream metrics"),
    }

    match outcome {
        Ok(report) => {
            info!(sent = report.sent, stop_reason = ?report.stop_reason, "END producer");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = e.exit_code();
            error!(error = %e, exit_code = code, "Producer failed");
            ExitCode::from(code)
        }
    }
}

async fn run() -> Result<PublishLoopReport, AppError> {
    let config = BuzzlineConfig::from_env()?;

    let transport = KafkaProducerTransport::connect(config.kafka_settings())
        .await
        .map_err(SetupError::from)?;

    let (shutdown, stop) = Shutdown::new();
    spawn_signal_listener(shutdown, "Producer");

    let mut source = RandomSentences::new();
    producer::run_producer(&config, transport, &mut source, stop).await
}
