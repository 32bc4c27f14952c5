//! Retry with exponential backoff for transient storage failures, and the
//! degraded-mode flag raised when retries run out.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use rankguard_domain::{DomainError, DomainResult};
use tracing::{debug, info, warn};

/// Backoff bounds for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Whether storage retries have been exhausted since the last successful call.
#[derive(Debug, Default)]
pub struct DegradedState {
    degraded: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl DegradedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// The error that put the service into degraded mode, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn mark(&self, error: &DomainError) {
        *self.last_error.write().unwrap_or_else(|e| e.into_inner()) = Some(error.to_string());
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(error = %error, "Storage retries exhausted, entering degraded mode");
            metrics::gauge!("rankguard_degraded").set(1.0);
        }
    }

    pub(crate) fn clear(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            *self.last_error.write().unwrap_or_else(|e| e.into_inner()) = None;
            info!("Storage call succeeded, leaving degraded mode");
            metrics::gauge!("rankguard_degraded").set(0.0);
        }
    }
}

/// Runs `op`, retrying retryable errors with backoff.
///
/// Success clears degraded mode. Exhausting the attempts on a retryable error
/// enters it. Non-retryable errors return immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    degraded: &DegradedState,
    operation: &str,
    mut op: F,
) -> DomainResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DomainResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                degraded.clear();
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying transient storage failure"
                );
                metrics::counter!("rankguard_storage_retries_total", "operation" => operation.to_string())
                    .increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    degraded.mark(&e);
                }
                return Err(e);
            }
        }
    }
}
