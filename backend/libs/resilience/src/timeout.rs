/// Deadlines for broker sends and message handlers
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
        }
    }
}

/// Either the deadline passed or the operation returned its own error.
#[derive(Debug, thiserror::Error)]
pub enum TimeoutError<E> {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> TimeoutError<E> {
    pub fn is_elapsed(&self) -> bool {
        matches!(self, TimeoutError::Elapsed(_))
    }
}

/// Run a fallible future under a deadline without erasing its error type.
///
/// Callers that classify errors (retryable or not) need the original value,
/// so `OperationFailed` carries it through untouched.
pub async fn with_timeout_result<F, T, E>(
    duration: Duration,
    future: F,
) -> Result<T, TimeoutError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match timeout(duration, future).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(TimeoutError::OperationFailed(e)),
        Err(_) => Err(TimeoutError::Elapsed(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_result_passes_through() {
        let result =
            with_timeout_result(Duration::from_secs(1), async { Ok::<_, String>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_deadline_elapsed() {
        let result = with_timeout_result(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, String>(42)
        })
        .await;

        assert!(result.unwrap_err().is_elapsed());
    }

    #[tokio::test]
    async fn test_operation_error_is_kept() {
        let result = with_timeout_result(Duration::from_secs(1), async {
            Err::<i32, _>("operation failed")
        })
        .await;

        assert!(matches!(
            result,
            Err(TimeoutError::OperationFailed("operation failed"))
        ));
    }
}
