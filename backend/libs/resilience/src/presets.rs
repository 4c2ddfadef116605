/// Preset configurations for broker-facing operations
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use std::time::Duration;

/// Configuration bundle for one kind of broker call
#[derive(Debug, Clone)]
pub struct OperationConfig {
    pub timeout: TimeoutConfig,
    pub retry: RetryConfig,
}

/// Producer sends
///
/// - Timeout: 30s delivery timeout
/// - Retry: 5 attempts, 100ms base, 5s cap, ±20% jitter
pub fn publish_config() -> OperationConfig {
    OperationConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(30),
        },
        retry: RetryConfig::default(),
    }
}

/// Consumer-side message handlers
///
/// - Timeout: 30s per handler invocation
/// - Retry: 3 attempts, 200ms base, 2s cap
pub fn handler_config() -> OperationConfig {
    OperationConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(30),
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: Some(0.2),
        },
    }
}

/// Admin calls (topic creation, metadata)
///
/// - Timeout: 10s
/// - Retry: 3 attempts (creation is idempotent)
pub fn admin_config() -> OperationConfig {
    OperationConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(10),
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: Some(0.2),
        },
    }
}
