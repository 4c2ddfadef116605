//! Error types for the event stream library.

use crate::state::SubscriptionState;
use thiserror::Error;

/// Errors raised while making sure a topic exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Name is empty or contains characters the broker rejects
    #[error("Invalid topic name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Broker refused to create or describe the topic
    #[error("Permission denied for topic '{topic}'")]
    PermissionDenied { topic: String },

    /// Broker could not be reached or did not answer in time
    #[error("Broker unavailable while ensuring topic '{topic}': {reason}")]
    BrokerUnavailable { topic: String, reason: String },
}

/// Errors returned by `publish`.
///
/// Transports report `Transient` for failures worth retrying. The publisher
/// converts an exhausted retry budget into `Fatal`, which always means the
/// message was NOT durably appended.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Network timeout, leader election, broker busy
    #[error("Transient publish failure on '{topic}': {reason}")]
    Transient { topic: String, reason: String },

    /// Serialization failure, message too large, authorization revoked, retries exhausted
    #[error("Fatal publish failure on '{topic}' after {attempts} attempt(s): {reason}")]
    Fatal {
        topic: String,
        attempts: u32,
        reason: String,
    },
}

impl PublishError {
    pub fn transient(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        PublishError::Transient {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn fatal(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        PublishError::Fatal {
            topic: topic.into(),
            attempts: 1,
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transient { .. })
    }

    /// Reason text without the classification prefix.
    pub fn reason(&self) -> &str {
        match self {
            PublishError::Transient { reason, .. } | PublishError::Fatal { reason, .. } => reason,
        }
    }
}

/// Consumer-side broker failures (connect, fetch, commit, close).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection could not be created
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Credentials rejected or authorization revoked
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// Temporary failure; the operation may succeed on retry
    #[error("Transient broker failure: {0}")]
    Transient(String),

    /// Unrecoverable failure reported by the broker or client
    #[error("Fatal broker error: {0}")]
    Fatal(String),
}

impl BrokerError {
    /// Unrecoverable errors move a subscription to `Failed`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Authorization(_) | BrokerError::Fatal(_)
        )
    }
}

/// Error returned by an application message handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Handling may succeed if attempted again
    #[error("Handler failed: {0}")]
    Transient(#[source] anyhow::Error),

    /// Message can never be handled; skip remaining retries
    #[error("Message rejected: {0}")]
    Rejected(#[source] anyhow::Error),
}

impl HandlerError {
    pub fn transient(message: impl std::fmt::Display) -> Self {
        HandlerError::Transient(anyhow::anyhow!("{}", message))
    }

    pub fn rejected(message: impl std::fmt::Display) -> Self {
        HandlerError::Rejected(anyhow::anyhow!("{}", message))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Errors surfaced by a subscription or its run loop.
#[derive(Error, Debug)]
pub enum SubscriberError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Handler failed and the failure policy halts the subscription
    #[error("Handler failed for {topic}[{partition}]@{offset} after {attempts} attempt(s): {source}")]
    Handler {
        topic: String,
        partition: i32,
        offset: i64,
        attempts: u32,
        #[source]
        source: HandlerError,
    },

    /// Dead-letter routing failed, so the message stays uncommitted
    #[error("Dead-letter routing failed for {topic}[{partition}]@{offset}: {source}")]
    DeadLetter {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: PublishError,
    },

    /// Commit requested for an offset that was never delivered
    #[error("Cannot commit {topic}[{partition}]@{offset}: last delivered offset is {last_delivered:?}")]
    CommitAhead {
        topic: String,
        partition: i32,
        offset: i64,
        last_delivered: Option<i64>,
    },

    /// Commit would move the cursor backwards
    #[error("Cannot commit {topic}[{partition}]@{offset}: already committed {committed}")]
    CommitBehind {
        topic: String,
        partition: i32,
        offset: i64,
        committed: i64,
    },

    #[error("Illegal subscription transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SubscriptionState,
        to: SubscriptionState,
    },
}

pub type PublishResult<T> = Result<T, PublishError>;
pub type SubscriberResult<T> = Result<T, SubscriberError>;
