//! Buzzline consumer - logs every message on the topic, committing after each batch.
//!
//! Environment variables:
//! - KAFKA_BROKER_ADDRESS: bootstrap servers (default: "localhost:9092")
//! - KAFKA_TOPIC: topic to read (default: "buzzline")
//! - KAFKA_CONSUMER_GROUP_ID: consumer group (default: "default_group")
//! - CONSUMER_START_POLICY: earliest, latest, or an offset (default: earliest)
//! - HANDLER_MAX_ATTEMPTS: handler attempts per message (default: 3)
//! - KAFKA_DEAD_LETTER_TOPIC: where failing messages go; unset halts instead
//! - POLL_TIMEOUT_MS / MAX_BATCH_SIZE: polling knobs
//!
//! Exit codes: 0 clean shutdown, 1 configuration or topic error,
//! 2 unrecoverable consumer error, 3 Kafka connection error.

use buzzline::consumer::{dead_letter_sink, run_consumer};
use buzzline::error::{AppError, SetupError};
use buzzline::handler::BuzzHandler;
use buzzline::signal::spawn_signal_listener;
use buzzline::{logging, BuzzlineConfig};
use event_stream::{
    ConsumeReport, KafkaConsumerTransport, KafkaProducerTransport, Shutdown, StreamMetrics,
};
use std::process::ExitCode;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_tracing();
    info!("START consumer");

    let outcome = run().await;
    match StreamMetrics::render() {
        Ok(text) => debug!(metrics = %text, "Final stream metrics"),
        Err(e) => debug!(error = %e, "Could not render stream metrics"),
    }

    match outcome {
        Ok(report) => {
            info!(
                handled = report.handled,
                dead_lettered = report.dead_lettered,
                "END consumer"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = e.exit_code();
            error!(error = %e, exit_code = code, "Consumer failed");
            ExitCode::from(code)
        }
    }
}

async fn run() -> Result<ConsumeReport, AppError> {
    let config = BuzzlineConfig::from_env()?;

    let dead_letter = if config.kafka_dead_letter_topic.is_some() {
        let transport = KafkaProducerTransport::connect(config.kafka_settings())
            .await
            .map_err(SetupError::from)?;
        dead_letter_sink(&config, transport).await?
    } else {
        None
    };

    let (shutdown, stop) = Shutdown::new();
    spawn_signal_listener(shutdown, "Consumer");

    run_consumer(
        &config,
        KafkaConsumerTransport::new(config.kafka_settings()),
        BuzzHandler::new(),
        dead_letter,
        stop,
    )
    .await
}
