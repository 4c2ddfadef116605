use event_stream::{BrokerError, PublishError, SubscriberError, TopicError};
use thiserror::Error;

/// Failures before the main loop starts.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Topic setup failed: {0}")]
    Topic(#[from] TopicError),

    #[error("Kafka connection failed: {0}")]
    Connection(String),
}

impl From<config::ConfigError> for SetupError {
    fn from(err: config::ConfigError) -> Self {
        SetupError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for SetupError {
    fn from(err: validator::ValidationErrors) -> Self {
        SetupError::Config(err.to_string())
    }
}

impl From<BrokerError> for SetupError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Connection(reason) | BrokerError::Authorization(reason) => {
                SetupError::Connection(reason)
            }
            other => SetupError::Connection(other.to_string()),
        }
    }
}

/// Everything that can end a producer or consumer process.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Subscriber(#[from] SubscriberError),
}

impl AppError {
    /// Process exit code: 1 config or topic setup, 2 runtime fatal, 3 connection.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Setup(SetupError::Config(_)) | AppError::Setup(SetupError::Topic(_)) => 1,
            AppError::Setup(SetupError::Connection(_)) => 3,
            AppError::Subscriber(SubscriberError::Topic(_)) => 1,
            AppError::Subscriber(SubscriberError::Broker(BrokerError::Connection(_))) => 3,
            AppError::Publish(_) | AppError::Subscriber(_) => 2,
        }
    }
}
