//! Bounded retry with backoff, jitter and circuit-breaker gating.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::breaker::CircuitBreaker;
use crate::error::{HarvestError, Result};

/// Backoff growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Exponential,
    Linear,
}

/// Static retry configuration for one class of operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Perturb delays ±20% so parallel workers desynchronize.
    pub jitter: bool,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// `min(max_delay, initial_delay * multiplier^(attempt-1))` for
    /// exponential backoff, a constant `initial_delay` for linear.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Linear => self.initial_delay_ms as f64,
            Backoff::Exponential => {
                self.initial_delay_ms as f64
                    * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32)
            }
        };
        let capped = base.min(self.max_delay_ms as f64);
        let delayed = if self.jitter {
            capped * (0.8 + fastrand::f64() * 0.4)
        } else {
            capped
        };
        Duration::from_millis(delayed.max(0.0) as u64)
    }
}

/// Drives an async operation through bounded retries.
///
/// When a breaker is attached it is consulted before every attempt and
/// receives exactly one report per attempt. Outer retry layers wrap
/// operations that already report at a lower level and therefore attach no
/// breaker of their own.
pub struct RetryStrategy {
    policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl RetryStrategy {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            breaker: None,
        }
    }

    pub fn with_breaker(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            policy,
            breaker: Some(breaker),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `operation`, retrying retriable failures until the policy's
    /// attempt budget is spent.
    ///
    /// Terminal failures return immediately and are reported to the breaker
    /// as successes: the upstream answered, the request was simply refused.
    /// Exhaustion wraps the final error in
    /// [`HarvestError::RetryExhausted`].
    pub async fn execute<T, F, Fut>(&self, context: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if let Some(breaker) = &self.breaker {
                breaker.try_acquire()?;
            }

            match operation().await {
                Ok(value) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    if attempt > 1 {
                        debug!(context, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retriable() => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    return Err(err);
                }
                Err(err) => {
                    if err.counts_against_breaker() {
                        if let Some(breaker) = &self.breaker {
                            breaker.record_failure();
                        }
                    }
                    if attempt >= max_attempts {
                        warn!(context, attempts = max_attempts, error = %err,
                              "retry budget exhausted");
                        return Err(HarvestError::RetryExhausted {
                            attempts: max_attempts,
                            source: Box::new(err),
                        });
                    }
                    let delay = self.policy.delay_for(attempt);
                    warn!(context, attempt, max_attempts, error = %err,
                          delay_ms = delay.as_millis() as u64,
                          "attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        unreachable!("retry loop returns on the final attempt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::breaker::BreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy_no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            backoff_multiplier: 2.0,
            max_delay_ms: 10,
            jitter: false,
            backoff: Backoff::Exponential,
        }
    }

    #[test]
    fn exponential_delays_double_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: false,
            backoff: Backoff::Exponential,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter: false,
            backoff: Backoff::Exponential,
        };
        assert_eq!(policy.delay_for(9), Duration::from_secs(5));
    }

    #[test]
    fn linear_backoff_is_constant() {
        let policy = RetryPolicy {
            backoff: Backoff::Linear,
            initial_delay_ms: 700,
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(700));
        assert_eq!(policy.delay_for(5), Duration::from_millis(700));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy {
            initial_delay_ms: 1_000,
            jitter: true,
            backoff: Backoff::Linear,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let ms = policy.delay_for(1).as_millis() as u64;
            assert!((800..=1_200).contains(&ms), "jittered delay {ms}ms out of range");
        }
    }

    #[tokio::test]
    async fn succeeds_after_retriable_failures() {
        let strategy = RetryStrategy::new(policy_no_jitter(5));
        let calls = AtomicU32::new(0);
        let result = strategy
            .execute("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(HarvestError::Network("reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_error_stops_after_one_call() {
        let strategy = RetryStrategy::new(policy_no_jitter(3));
        let calls = AtomicU32::new(0);
        let result: Result<()> = strategy
            .execute("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(HarvestError::Protocol { status: 404 }) }
            })
            .await;
        assert!(matches!(result, Err(HarvestError::Protocol { status: 404 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_error() {
        let strategy = RetryStrategy::new(policy_no_jitter(3));
        let calls = AtomicU32::new(0);
        let result: Result<()> = strategy
            .execute("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(HarvestError::ServerOverload { status: 503 }) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(HarvestError::RetryExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, HarvestError::ServerOverload { status: 503 }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_breaker_denies_without_calling_operation() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            enabled: true,
            failure_threshold: 1,
            recovery_timeout_ms: 60_000,
            half_open_max_attempts: 1,
        }));
        breaker.record_failure();

        let strategy = RetryStrategy::with_breaker(policy_no_jitter(3), breaker);
        let calls = AtomicU32::new(0);
        let result: Result<()> = strategy
            .execute("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(HarvestError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn breaker_counts_only_upstream_failures() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            enabled: true,
            failure_threshold: 10,
            recovery_timeout_ms: 60_000,
            half_open_max_attempts: 1,
        }));

        let strategy = RetryStrategy::with_breaker(policy_no_jitter(2), breaker.clone());

        // Network failures are recorded...
        let _: Result<()> = strategy
            .execute("net", || async { Err(HarvestError::Network("t/o".into())) })
            .await;
        assert_eq!(breaker.failure_count(), 2);

        // ...but a terminal protocol answer decays the count as a success.
        let _: Result<()> = strategy
            .execute("proto", || async { Err(HarvestError::Protocol { status: 404 }) })
            .await;
        assert_eq!(breaker.failure_count(), 1);
    }
}
