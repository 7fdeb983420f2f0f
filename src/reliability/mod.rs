//! Reliability primitives: backoff retries and visibility polling.

pub mod retry;

pub use retry::{RetryPolicy, Visibility, is_retryable, poll_until_visible, retry_with_backoff};
