//! Classified retry with exponential backoff around a single provider call.
//!
//! Only throttling failures are retried. Each retry waits 5/4 of the previous
//! delay, optionally jittered uniformly in `[0, delay)`, until either the
//! attempt cap or the elapsed-time cap is hit. Everything else propagates
//! immediately.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};

use crate::config::RetrySettings;
use crate::error::ProviderError;

/// Decides whether a provider error is throttling.
pub type ThrottleClassifier = Arc<dyn Fn(&ProviderError) -> bool + Send + Sync>;

/// Error codes providers use to signal throttling.
pub const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "LimitExceededException",
    "SlowDown",
    "PriorRequestNotComplete",
    "EC2ThrottledException",
];

/// Default classifier: a known throttling code or HTTP 429.
pub fn is_throttling(error: &ProviderError) -> bool {
    THROTTLING_CODES.contains(&error.code.as_str()) || error.status == Some(429)
}

/// Backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub initial_delay: Duration,
    /// Stop retrying once this much time has passed since the first attempt.
    pub timeout: Duration,
    /// Total attempts including the first; zero means bounded by `timeout` only.
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            max_attempts: 0,
            jitter: false,
        }
    }
}

impl Backoff {
    /// The provider-call default: four attempts, 30s initial delay, jittered.
    pub fn provider_default() -> Self {
        Self::from(&RetrySettings::default())
    }

    pub fn next_delay(delay: Duration) -> Duration {
        delay * 5 / 4
    }

    fn pause_for(&self, delay: Duration) -> Duration {
        let millis = delay.as_millis() as u64;
        if self.jitter && millis > 0 {
            Duration::from_millis(rand::rng().random_range(0..millis))
        } else {
            delay
        }
    }
}

impl From<&RetrySettings> for Backoff {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            timeout: Duration::from_secs(settings.timeout_secs),
            max_attempts: settings.max_attempts,
            jitter: settings.jitter,
        }
    }
}

/// Wraps provider calls with throttling-aware retries.
#[derive(Clone)]
pub struct RetryPolicy {
    backoff: Backoff,
    should_retry: ThrottleClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::provider_default(),
            should_retry: Arc::new(is_throttling),
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Replace the throttling classifier.
    pub fn with_should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProviderError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(f);
        self
    }

    /// Treat errors matching `f` as throttling in addition to the current rule.
    pub fn with_chained_should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProviderError) -> bool + Send + Sync + 'static,
    {
        let base = Arc::clone(&self.should_retry);
        self.should_retry = Arc::new(move |e| base(e) || f(e));
        self
    }

    /// Treat one more provider error code as throttling.
    pub fn with_retry_on_error_code(self, code: impl Into<String>) -> Self {
        let code = code.into();
        self.with_chained_should_retry(move |e| e.code == code)
    }

    pub fn is_throttling(&self, error: &ProviderError) -> bool {
        (self.should_retry)(error)
    }

    /// Run `f`, retrying throttled attempts. Returns the last error once the
    /// error is not throttling or the budget is exhausted.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let start = Instant::now();
        let mut delay = self.backoff.initial_delay;
        let mut attempt: u32 = 1;

        loop {
            let error = match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "Provider call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !self.is_throttling(&error) {
                return Err(error);
            }
            if self.backoff.max_attempts > 0 && attempt >= self.backoff.max_attempts {
                tracing::warn!(operation, attempts = attempt, error = %error, "Throttled call exhausted retries");
                return Err(error);
            }
            if start.elapsed() >= self.backoff.timeout {
                tracing::warn!(
                    operation,
                    attempts = attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %error,
                    "Throttled call exceeded retry timeout"
                );
                return Err(error);
            }

            let pause = self.backoff.pause_for(delay);
            tracing::warn!(
                operation,
                attempt = attempt + 1,
                delay_ms = pause.as_millis() as u64,
                error = %error,
                "Provider throttled, backing off"
            );
            sleep(pause).await;
            attempt += 1;
            delay = Backoff::next_delay(delay);
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
