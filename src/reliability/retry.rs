//! Exponential backoff retry logic for transient failures.
//!
//! Two helpers live here. [`retry_with_backoff`] re-runs a fallible
//! operation for callers that decide, via [`is_retryable`], that the
//! failure is transient. [`poll_until_visible`] re-reads an
//! eventually-consistent store until a row appears, returning a typed
//! [`Visibility::NotYetVisible`] instead of an error when it never does.
//! The engine itself never silently retries a failed payment call; these
//! helpers exist for read-back polling and for embedding applications.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{EngineError, Result};

/// Configuration for retry behavior.
///
/// Defines the parameters for exponential backoff. The delay between
/// attempts grows by `backoff_multiplier` up to `max_delay`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use billing_orchestrator::reliability::RetryPolicy;
///
/// // Default policy: 3 attempts, 100ms initial delay, 5s max delay
/// let policy = RetryPolicy::default();
///
/// // Custom policy: more patient polling
/// let patient = RetryPolicy {
///     max_attempts: 6,
///     initial_delay: Duration::from_millis(250),
///     max_delay: Duration::from_secs(10),
///     backoff_multiplier: 2.0,
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (default: 3)
    pub max_attempts: u32,
    /// Initial delay between attempts (default: 100ms)
    pub initial_delay: Duration,
    /// Maximum delay between attempts (default: 5s)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy with custom maximum attempts.
    ///
    /// # Examples
    ///
    /// ```
    /// use billing_orchestrator::reliability::RetryPolicy;
    ///
    /// let policy = RetryPolicy::with_max_attempts(5);
    /// assert_eq!(policy.max_attempts, 5);
    /// ```
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Builds a policy from the `[retry]` configuration section.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// Calculates delay for a specific attempt.
    ///
    /// Uses exponential backoff: delay = `initial_delay` * (multiplier ^ attempt)
    /// Capped at `max_delay` to prevent excessive waits.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(
            clippy::cast_precision_loss,
            reason = "acceptable for duration calculations"
        )]
        let delay_ms = self.initial_delay.as_millis() as f64
            * self
                .backoff_multiplier
                .powi(attempt.try_into().expect("attempt count should fit in i32"));
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "delay_ms is guaranteed to be positive and within reasonable bounds"
        )]
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }
}

/// Executes operation with exponential backoff retry.
///
/// Retries the operation up to `max_attempts` times, with exponentially
/// increasing delays between attempts. The caller decides what is worth
/// retrying; pair this with [`is_retryable`] to avoid re-running requests
/// that already failed for a permanent reason.
///
/// # Examples
///
/// ```
/// use std::sync::{
///     Arc,
///     atomic::{AtomicU32, Ordering},
/// };
///
/// use billing_orchestrator::reliability::{RetryPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<String, String> {
/// let policy = RetryPolicy::default();
/// let attempt = Arc::new(AtomicU32::new(0));
///
/// let result = retry_with_backoff(&policy, || {
///     let attempt = Arc::clone(&attempt);
///     async move {
///         let n = attempt.fetch_add(1, Ordering::Relaxed);
///         if n < 2 {
///             Err("temporary failure".to_string())
///         } else {
///             Ok("success".to_string())
///         }
///     }
/// })
/// .await?;
///
/// assert_eq!(result, "success");
/// # Ok(result)
/// # }
/// ```
///
/// # Errors
///
/// Returns the last error encountered if all attempts fail.
///
/// # Panics
///
/// Panics if `max_attempts` is 0 (which would be a configuration error).
/// Always configure `RetryPolicy` with at least 1 attempt.
#[allow(clippy::missing_panics_doc, reason = "panic documented above")]
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    error = %error,
                    "Operation failed, will retry if attempts remain"
                );

                last_error = Some(error);

                // Don't sleep after the last attempt
                if attempt + 1 < policy.max_attempts {
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::debug!(delay_ms = delay.as_millis(), "Sleeping before retry");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // All attempts exhausted, return last error
    Err(last_error.expect("at least one attempt should have been made"))
}

/// Outcome of probing an eventually-consistent read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility<T> {
    /// The row was found.
    Visible(T),
    /// The row has not become readable yet.
    NotYetVisible,
}

impl<T> Visibility<T> {
    /// Whether the probe found the row.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        matches!(self, Self::Visible(_))
    }

    /// Converts into an `Option`, discarding the distinction between
    /// "never probed" and "probed and absent".
    #[must_use]
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Visible(value) => Some(value),
            Self::NotYetVisible => None,
        }
    }
}

/// Probes an eventually-consistent read until it becomes visible.
///
/// The probe runs up to `max_attempts` times with the policy's backoff
/// between attempts. A probe returning [`Visibility::NotYetVisible`] is
/// not an error; if the row never appears the final result is
/// `Ok(Visibility::NotYetVisible)` and the caller decides what that
/// means. A probe returning `Err` aborts the poll immediately.
///
/// # Errors
///
/// Propagates the first hard error returned by the probe.
pub async fn poll_until_visible<F, Fut, T>(
    policy: &RetryPolicy,
    mut probe: F,
) -> Result<Visibility<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Visibility<T>>>,
{
    for attempt in 0..policy.max_attempts {
        match probe().await? {
            Visibility::Visible(value) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Row became visible after polling");
                }
                return Ok(Visibility::Visible(value));
            }
            Visibility::NotYetVisible => {
                if attempt + 1 < policy.max_attempts {
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        "Row not visible yet, polling again"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    warn!(
        attempts = policy.max_attempts,
        "Row did not become visible within the polling budget"
    );
    Ok(Visibility::NotYetVisible)
}

/// Determines if an error is retryable.
///
/// Returns `true` for transient failures that might succeed on a fresh
/// attempt: HTTP timeouts, connection failures, 5xx responses, gateway
/// SDK load failures and rejected order creation.
///
/// Returns `false` for everything that retrying cannot fix: failed
/// verification, consumed trials, exhausted coupons, validation errors,
/// and post-payment persistence failures, which need reconciliation
/// rather than a blind replay.
///
/// # Examples
///
/// ```
/// use billing_orchestrator::{EngineError, reliability::is_retryable};
///
/// // A failed SDK load is worth another attempt
/// let error = EngineError::GatewayLoad("script timed out".to_string());
/// assert!(is_retryable(&error));
///
/// // A failed verification is not
/// let error = EngineError::Verification("signature mismatch".to_string());
/// assert!(!is_retryable(&error));
/// ```
#[must_use]
#[allow(
    clippy::match_same_arms,
    reason = "separate arms for clarity and future extensibility"
)]
pub fn is_retryable(error: &EngineError) -> bool {
    match error {
        EngineError::Http(e) => {
            // Retry on timeouts, connection errors, or server errors
            e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
        }
        // The gateway script and order creation can fail transiently
        EngineError::GatewayLoad(_) | EngineError::OrderCreation(_) => true,
        // A rejected verification stays rejected
        EngineError::Verification(_) => false,
        // Cancellation is a user decision, not a fault
        EngineError::UserCancelled => false,
        // Trial state does not change by asking again
        EngineError::TrialAlreadyUsed | EngineError::TrialAlreadyActive => false,
        // Money already moved; this needs reconciliation, not a replay
        EngineError::SubscriptionPersist(_) => false,
        // Don't retry exhausted coupons or resolution failures
        EngineError::CouponExhausted(_) | EngineError::IdentityNotFound(_) => false,
        // Don't retry validation or configuration errors
        EngineError::InvalidInput(_) | EngineError::Config(_) => false,
        // A malformed backend response will stay malformed
        EngineError::Backend(_) => false,
    }
}

#[cfg(test)]
#[allow(
    clippy::str_to_string,
    clippy::float_cmp,
    reason = "test code uses these patterns for readability"
)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = RetryConfig {
            max_attempts: 7,
            initial_delay_ms: 40,
            max_delay_ms: 900,
            backoff_multiplier: 3.0,
        };

        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.initial_delay, Duration::from_millis(40));
        assert_eq!(policy.max_delay, Duration::from_millis(900));
        assert!((policy.backoff_multiplier - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::default();

        // First retry: 100ms * 2^0 = 100ms
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));

        // Second retry: 100ms * 2^1 = 200ms
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));

        // Third retry: 100ms * 2^2 = 400ms
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        };

        // Large attempt number should be capped at max_delay
        let delay = policy.delay_for_attempt(10);
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retry_with_backoff_success_first_attempt() {
        let policy = RetryPolicy::with_max_attempts(3);
        let call_count = Arc::new(Mutex::new(0));

        let count_clone = Arc::clone(&call_count);
        let result = retry_with_backoff(&policy, || {
            let count = Arc::clone(&count_clone);
            async move {
                let mut c = count.lock().unwrap();
                *c += 1;
                Ok::<i32, EngineError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*call_count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_success_after_retries() {
        let policy = RetryPolicy::with_max_attempts(3);
        let call_count = Arc::new(Mutex::new(0));

        let count_clone = Arc::clone(&call_count);
        let result = retry_with_backoff(&policy, || {
            let count = Arc::clone(&count_clone);
            async move {
                let mut c = count.lock().unwrap();
                *c += 1;
                let current = *c;
                drop(c);

                if current < 3 {
                    Err(EngineError::GatewayLoad("temporary failure".to_string()))
                } else {
                    Ok::<i32, EngineError>(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*call_count.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_all_attempts_fail() {
        let policy = RetryPolicy::with_max_attempts(3);
        let call_count = Arc::new(Mutex::new(0));

        let count_clone = Arc::clone(&call_count);
        let result = retry_with_backoff(&policy, || {
            let count = Arc::clone(&count_clone);
            async move {
                let mut c = count.lock().unwrap();
                *c += 1;
                drop(c);
                Err::<i32, EngineError>(EngineError::GatewayLoad("persistent error".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(*call_count.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_timing() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        };
        let call_count = Arc::new(Mutex::new(0));

        let start = std::time::Instant::now();
        let count_clone = Arc::clone(&call_count);
        let _result = retry_with_backoff(&policy, || {
            let count = Arc::clone(&count_clone);
            async move {
                let mut c = count.lock().unwrap();
                *c += 1;
                drop(c);
                Err::<i32, EngineError>(EngineError::OrderCreation("error".to_string()))
            }
        })
        .await;

        let elapsed = start.elapsed();

        // Should have delays: 10ms + 20ms = 30ms minimum
        // Allow some overhead for test execution
        assert!(
            elapsed >= Duration::from_millis(30),
            "Expected at least 30ms, got {elapsed:?}"
        );
        assert_eq!(*call_count.lock().unwrap(), 3);
    }

    // ===== Visibility polling =====

    #[tokio::test]
    async fn test_poll_visible_immediately() {
        let policy = RetryPolicy::with_max_attempts(3);
        let call_count = Arc::new(Mutex::new(0));

        let count_clone = Arc::clone(&call_count);
        let result = poll_until_visible(&policy, || {
            let count = Arc::clone(&count_clone);
            async move {
                let mut c = count.lock().unwrap();
                *c += 1;
                Ok(Visibility::Visible("row"))
            }
        })
        .await
        .unwrap();

        assert_eq!(result, Visibility::Visible("row"));
        assert_eq!(*call_count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_poll_visible_after_delay() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
        };
        let call_count = Arc::new(Mutex::new(0));

        let count_clone = Arc::clone(&call_count);
        let result = poll_until_visible(&policy, || {
            let count = Arc::clone(&count_clone);
            async move {
                let mut c = count.lock().unwrap();
                *c += 1;
                if *c < 3 {
                    Ok(Visibility::NotYetVisible)
                } else {
                    Ok(Visibility::Visible(42))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, Visibility::Visible(42));
        assert_eq!(*call_count.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_poll_exhausted_returns_not_yet_visible() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };
        let call_count = Arc::new(Mutex::new(0));

        let count_clone = Arc::clone(&call_count);
        let result = poll_until_visible(&policy, || {
            let count = Arc::clone(&count_clone);
            async move {
                let mut c = count.lock().unwrap();
                *c += 1;
                Ok(Visibility::<i32>::NotYetVisible)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, Visibility::NotYetVisible);
        assert_eq!(*call_count.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_poll_propagates_hard_errors() {
        let policy = RetryPolicy::with_max_attempts(5);
        let call_count = Arc::new(Mutex::new(0));

        let count_clone = Arc::clone(&call_count);
        let result: Result<Visibility<i32>> = poll_until_visible(&policy, || {
            let count = Arc::clone(&count_clone);
            async move {
                let mut c = count.lock().unwrap();
                *c += 1;
                Err(EngineError::Backend("store offline".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        // A hard error stops the poll, no further attempts
        assert_eq!(*call_count.lock().unwrap(), 1);
    }

    // ===== Retryability classification =====

    #[test]
    fn test_gateway_load_is_retryable() {
        assert!(is_retryable(&EngineError::GatewayLoad(
            "script timed out".to_string()
        )));
    }

    #[test]
    fn test_order_creation_is_retryable() {
        assert!(is_retryable(&EngineError::OrderCreation(
            "backend busy".to_string()
        )));
    }

    #[test]
    fn test_verification_failure_is_not_retryable() {
        assert!(!is_retryable(&EngineError::Verification(
            "signature mismatch".to_string()
        )));
    }

    #[test]
    fn test_user_cancellation_is_not_retryable() {
        assert!(!is_retryable(&EngineError::UserCancelled));
    }

    #[test]
    fn test_trial_errors_are_not_retryable() {
        assert!(!is_retryable(&EngineError::TrialAlreadyUsed));
        assert!(!is_retryable(&EngineError::TrialAlreadyActive));
    }

    #[test]
    fn test_persist_failure_is_not_retryable() {
        assert!(!is_retryable(&EngineError::SubscriptionPersist(
            "write failed".to_string()
        )));
    }

    #[test]
    fn test_exhausted_coupon_is_not_retryable() {
        assert!(!is_retryable(&EngineError::CouponExhausted(
            "SAVE20".to_string()
        )));
    }

    #[test]
    fn test_invalid_input_is_not_retryable() {
        assert!(!is_retryable(&EngineError::InvalidInput(
            "bad plan id".to_string()
        )));
    }
}
