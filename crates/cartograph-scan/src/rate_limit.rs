//! Per-unit pacing of provider calls.
//!
//! A token bucket limits one scan unit to R calls per second. R resolves as
//! explicit override > per-type configured override > per-type coded default >
//! unlimited. A non-positive or non-finite rate means unlimited.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};

type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Pauses longer than this are logged.
const PAUSE_LOG_THRESHOLD: Duration = Duration::from_millis(50);

/// Token bucket for a single scan unit. Clone shares the bucket.
#[derive(Clone)]
pub struct RateLimiter {
    label: String,
    per_second: Option<f64>,
    limiter: Option<Arc<DirectLimiter>>,
}

impl RateLimiter {
    pub fn unlimited(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            per_second: None,
            limiter: None,
        }
    }

    pub fn per_second(label: impl Into<String>, rate: f64) -> Self {
        let label = label.into();
        if !rate.is_finite() || rate <= 0.0 {
            return Self::unlimited(label);
        }
        match Quota::with_period(Duration::from_secs_f64(1.0 / rate)) {
            Some(quota) => Self {
                label,
                per_second: Some(rate),
                limiter: Some(Arc::new(GovernorRateLimiter::direct(quota))),
            },
            None => Self::unlimited(label),
        }
    }

    /// Resolve the effective rate from the override chain.
    ///
    /// An explicit override wins even when it asks for "unlimited".
    pub fn resolve(
        label: impl Into<String>,
        explicit: Option<f64>,
        configured: Option<f64>,
        coded_default: Option<f64>,
    ) -> Self {
        let label = label.into();
        match explicit.or(configured).or(coded_default) {
            Some(rate) => Self::per_second(label, rate),
            None => Self::unlimited(label),
        }
    }

    /// Effective calls/second, `None` when unlimited.
    pub fn limit(&self) -> Option<f64> {
        self.per_second
    }

    /// Block until a token is available.
    pub async fn acquire(&self) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        let start = Instant::now();
        limiter.until_ready().await;
        let paused = start.elapsed();
        if paused > PAUSE_LOG_THRESHOLD {
            tracing::info!(
                scanner = %self.label,
                paused_ms = paused.as_millis() as u64,
                "Rate limiting paused execution"
            );
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("label", &self.label)
            .field("per_second", &self.per_second)
            .finish()
    }
}
