//! Retry and backoff for Rewind persistence writes
//!
//! Durable stores fail transiently (a locked file, a busy database, a flaky
//! remote). The persistence gateway wraps each write in [`with_backoff`] so a
//! short outage does not lose the latest state.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' gave up after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RetryError {
    /// The underlying failure, regardless of how it was classified.
    pub fn source_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        match self {
            Self::MaxRetriesExceeded { source, .. }
            | Self::Transient { source, .. }
            | Self::Permanent { source, .. } => source.as_ref(),
        }
    }

    fn into_source(self) -> Box<dyn std::error::Error + Send + Sync> {
        match self {
            Self::MaxRetriesExceeded { source, .. }
            | Self::Transient { source, .. }
            | Self::Permanent { source, .. } => source,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Boxed future for retry operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RetryResult<T>> + Send + 'a>>;

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed_time: Option<Duration>,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Policy for in-process or local file stores (short waits)
    pub fn local() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            max_elapsed_time: Some(Duration::from_secs(10)),
            multiplier: 2.0,
        }
    }

    /// Policy for stores reached over a network
    pub fn remote() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(60)),
            multiplier: 1.5,
        }
    }

    /// A single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::local()
        }
    }

    /// Build the exponential backoff schedule for one retried operation.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(self.max_elapsed_time)
            .with_multiplier(self.multiplier)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::local()
    }
}

/// Execute an operation with the default (local) policy
pub async fn with_default_backoff<F, T>(op_name: &'static str, f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'static, T>,
{
    with_backoff(op_name, &RetryPolicy::default(), f).await
}

/// Execute `f` until it succeeds, fails permanently, or the policy runs out.
///
/// `f` receives the 1-based attempt number. Transient errors are retried after
/// the next backoff interval; a permanent error stops immediately and is
/// returned as-is.
pub async fn with_backoff<F, T>(op_name: &'static str, policy: &RetryPolicy, mut f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'static, T>,
{
    let mut schedule = policy.backoff();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err @ RetryError::Permanent { .. }) => {
                warn!(operation = op_name, attempt, error = %err, "operation failed permanently");
                return Err(err);
            }
            Err(err) => {
                warn!(operation = op_name, attempt, error = %err, "operation failed");

                let delay = if attempt < max_attempts {
                    schedule.next_backoff()
                } else {
                    None
                };
                let Some(delay) = delay else {
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source: err.into_source(),
                    });
                };

                attempt += 1;

                #[cfg(feature = "async-rt")]
                tokio::time::sleep(delay).await;

                #[cfg(not(feature = "async-rt"))]
                std::thread::sleep(delay);
            }
        }
    }
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Wrap `err` as transient or permanent according to its own classification.
pub fn classify<E>(operation: &'static str, err: E) -> RetryError
where
    E: RetryableError + std::error::Error + Send + Sync + 'static,
{
    if err.is_transient() {
        RetryError::Transient {
            operation,
            source: Box::new(err),
        }
    } else {
        RetryError::Permanent {
            operation,
            source: Box::new(err),
        }
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: Box::new($err),
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: Box::new($err),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed_time: Some(Duration::from_secs(5)),
            multiplier: 1.0,
        }
    }

    fn refused() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let result =
            with_default_backoff("test_op", |_attempt| Box::pin(async { Ok("success") })).await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result = with_backoff("test_op", &quick_policy(3), move |_attempt| {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if count < 2 {
                    Err(transient_error!("test_op", refused()))
                } else {
                    Ok("success")
                }
            })
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result: RetryResult<()> = with_backoff("test_op", &quick_policy(2), move |_attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(transient_error!("test_op", refused())) })
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::MaxRetriesExceeded { attempts: 2, .. })
        ));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result: RetryResult<&str> = with_backoff("test_op", &quick_policy(5), move |_attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err(permanent_error!(
                    "test_op",
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied")
                ))
            })
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_classify_uses_error_kind() {
        #[derive(Debug, Error)]
        #[error("flaky")]
        struct Flaky(bool);

        impl RetryableError for Flaky {
            fn is_transient(&self) -> bool {
                self.0
            }
        }

        assert!(matches!(classify("op", Flaky(true)), RetryError::Transient { .. }));
        assert!(matches!(classify("op", Flaky(false)), RetryError::Permanent { .. }));
        assert_eq!(classify("op", Flaky(false)).source_error().to_string(), "flaky");
    }

    #[test]
    fn test_policy_presets() {
        assert_eq!(RetryPolicy::none().max_attempts, 1);
        assert!(RetryPolicy::remote().initial_interval > RetryPolicy::local().initial_interval);
        assert_eq!(RetryPolicy::default(), RetryPolicy::local());
    }
}
