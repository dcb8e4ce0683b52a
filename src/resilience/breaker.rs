//! Circuit breaker guarding calls against one upstream dependency.
//!
//! One instance is shared by every operation that targets the same origin;
//! all state transitions happen under a single mutex so concurrent success
//! and failure reports cannot race the machine into an inconsistent state.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::HarvestError;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing fast, calls are denied until the cool-down elapses.
    Open,
    /// Probing recovery with a bounded number of trial calls.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Static breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Failure count at which the breaker opens.
    pub failure_threshold: u32,
    /// Cool-down before an open breaker admits a trial call.
    pub recovery_timeout_ms: u64,
    /// Trial successes required to close again; also the admission cap.
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 20,
            recovery_timeout_ms: 300_000,
            half_open_max_attempts: 3,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
}

/// Thread-safe circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_at: None,
                half_open_admitted: 0,
                half_open_successes: 0,
            }),
        }
    }

    /// A breaker that always permits and records nothing.
    pub fn disabled() -> Self {
        Self::new(BreakerConfig {
            enabled: false,
            ..BreakerConfig::default()
        })
    }

    /// Ask permission to execute one call.
    ///
    /// While open, denies with [`HarvestError::CircuitOpen`] until the
    /// cool-down has elapsed; the first caller after that is admitted as the
    /// half-open trial. Half-open admissions are capped at
    /// `half_open_max_attempts`.
    pub fn try_acquire(&self) -> Result<(), HarvestError> {
        if !self.config.enabled {
            return Ok(());
        }
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_max_attempts {
                    inner.half_open_admitted += 1;
                    Ok(())
                } else {
                    Err(HarvestError::CircuitOpen {
                        remaining: Duration::ZERO,
                    })
                }
            }
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                let timeout = self.config.recovery_timeout();
                if elapsed >= timeout {
                    info!(
                        cooldown_ms = self.config.recovery_timeout_ms,
                        "circuit breaker open -> half-open, admitting trial call"
                    );
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_admitted = 1;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(HarvestError::CircuitOpen {
                        remaining: timeout - elapsed,
                    })
                }
            }
        }
    }

    /// Report a successful call.
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_attempts {
                    info!("circuit breaker half-open -> closed, upstream recovered");
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_admitted = 0;
                    inner.half_open_successes = 0;
                }
            }
            // Slow decay rather than a hard reset: a lone success amid a
            // failure burst must not wipe the evidence.
            BreakerState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            BreakerState::Open => {}
        }
    }

    /// Report a failed call.
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        failures = inner.failure_count,
                        "circuit breaker closed -> open, upstream unhealthy"
                    );
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::HalfOpen => {
                warn!("circuit breaker half-open -> open, trial call failed");
                inner.state = BreakerState::Open;
                inner.half_open_admitted = 0;
                inner.half_open_successes = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().expect("breaker mutex poisoned").failure_count
    }
}
