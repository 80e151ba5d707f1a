//! Bounded or unbounded retry with linear backoff around inventory calls.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::RetryOptions;
use crate::errors::{RetryError, UpstreamError};
use crate::telemetry::ConsumerMetrics;

pub const BACKOFF_BASE_UNIT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBound {
    Limited(u32),
    Unbounded,
}

impl RetryBound {
    /// Negative values mean unbounded.
    pub fn from_config(value: i32) -> Self {
        u32::try_from(value).map_or(RetryBound::Unbounded, RetryBound::Limited)
    }

    /// Whether another try is allowed after `done` tries.
    pub fn allows(&self, done: u32) -> bool {
        match self {
            RetryBound::Unbounded => true,
            RetryBound::Limited(max) => done < *max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: RetryBound,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
    pub base_unit: Duration,
}

impl RetryPolicy {
    /// Policy for a single inventory call.
    pub fn for_operations(options: &RetryOptions) -> Self {
        Self::with_bound(options, options.operation_max_retries)
    }

    /// Policy for restarting the consumer.
    pub fn for_restarts(options: &RetryOptions) -> Self {
        Self::with_bound(options, options.consumer_max_retries)
    }

    fn with_bound(options: &RetryOptions, bound: i32) -> Self {
        Self {
            max_attempts: RetryBound::from_config(bound),
            backoff_factor: options.backoff_factor,
            max_backoff: Duration::from_secs(options.max_backoff_seconds),
            base_unit: BACKOFF_BASE_UNIT,
        }
    }

    /// `min(factor * attempts * base_unit, max_backoff)`
    pub fn backoff(&self, attempts: u32) -> Duration {
        self.base_unit
            .saturating_mul(self.backoff_factor.saturating_mul(attempts))
            .min(self.max_backoff)
    }
}

/// Result of a call that did not exhaust its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Completed(T),
    /// The classifier asked to stop; the message is handled without a result.
    Dropped,
}

impl<T> RetryOutcome<T> {
    pub fn is_dropped(&self) -> bool {
        matches!(self, RetryOutcome::Dropped)
    }
}

/// Decides whether an error ends the retry loop as a drop.
pub type Classifier<'a> = &'a (dyn Fn(&UpstreamError) -> bool + Send + Sync);

#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    metrics: ConsumerMetrics,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, metrics: ConsumerMetrics) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `op` until it succeeds, the classifier drops it, or the attempt
    /// bound is reached. Every failed attempt is counted under `call_site`.
    pub async fn execute<T, F, Fut>(
        &self,
        call_site: &str,
        mut op: F,
        classifier: Option<Classifier<'_>>,
    ) -> Result<RetryOutcome<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(RetryOutcome::Completed(value)),
                Err(err) => err,
            };

            self.metrics.record_failure(call_site, Some(err.kind()));
            if classifier.is_some_and(|classify| classify(&err)) {
                warn!(call_site, error = %err, "request short-circuited, dropping message");
                return Ok(RetryOutcome::Dropped);
            }

            attempts = attempts.saturating_add(1);
            error!(call_site, attempts, error = %err, "request failed");
            if !self.policy.max_attempts.allows(attempts) {
                error!(call_site, attempts, "max attempts reached");
                return Err(RetryError::MaxRetriesExceeded {
                    attempts,
                    last_error: err.to_string(),
                });
            }

            let backoff = self.policy.backoff(attempts);
            error!(call_site, ?backoff, "retrying");
            tokio::time::sleep(backoff).await;
        }
    }
}
