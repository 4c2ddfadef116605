/// Resilience helpers for broker clients
///
/// This library provides:
/// - **Retry**: Exponential backoff with jitter, with a retryability predicate
/// - **Timeout**: Time limits that keep the wrapped operation's error type
/// - **Preset Configurations**: Pre-tuned settings for publish, handler, and admin calls
///
/// # Example: Retry only transient failures
///
/// ```rust,no_run
/// use resilience::{presets, with_retry_if};
///
/// #[tokio::main]
/// async fn main() {
///     let config = presets::publish_config();
///
///     let result = with_retry_if(
///         config.retry,
///         |e: &String| e.starts_with("transient"),
///         || async { Ok::<_, String>(()) },
///     )
///     .await;
/// }
/// ```

pub mod presets;
pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use presets::{admin_config, handler_config, publish_config, OperationConfig};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
pub use timeout::{with_timeout_result, TimeoutConfig, TimeoutError};
