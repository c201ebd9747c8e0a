//! Failure isolation for calls to an external dependency
//!
//! One breaker guards one dependency and is shared by every call that uses
//! it. After `failure_threshold` consecutive failures the breaker opens and
//! short-circuits for `reset_timeout`; the first caller after that runs a
//! single trial (half-open). A successful trial closes the breaker, a failed
//! one re-opens it with a fresh failure timestamp.

use crate::domain::shared::{DomainError, Result};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of a breaker, for health reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub reset_timeout_secs: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

enum Admission {
    Normal,
    Trial,
    Rejected,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                reset_timeout: config.reset_timeout,
            },
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` through the breaker; short-circuits with
    /// [`DomainError::CircuitOpen`] while open.
    pub async fn call<T, Op, Fut>(&self, operation: Op) -> Result<T>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let trial = match self.admit() {
            Admission::Normal => false,
            Admission::Trial => true,
            Admission::Rejected => {
                counter!("breaker_short_circuits_total", "breaker" => self.name.clone())
                    .increment(1);
                return Err(DomainError::CircuitOpen(self.name.clone()));
            }
        };

        let mut guard = TrialGuard {
            breaker: self,
            armed: trial,
        };
        let result = operation().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.on_success(trial),
            Err(e) => self.on_failure(trial, e),
        }
        result
    }

    /// Like [`call`](Self::call), but a short-circuited call yields
    /// `fallback()` instead of an error. Failures of the operation itself are
    /// still returned.
    pub async fn execute<T, Op, Fut, Fb>(&self, operation: Op, fallback: Fb) -> Result<T>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        Fb: FnOnce() -> T,
    {
        match self.call(operation).await {
            Err(DomainError::CircuitOpen(name)) => {
                debug!(breaker = %name, "circuit open, serving fallback");
                Ok(fallback())
            }
            other => other,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            last_failure_at: inner.last_failure_at,
            reset_timeout_secs: self.config.reset_timeout.as_secs(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // state stays consistent even if a holder panicked: every write is a
        // single assignment group with no await in between
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Admission::Normal,
            BreakerState::Open => {
                let cooled = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if cooled {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected
                } else {
                    inner.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        if trial {
            inner.trial_in_flight = false;
        }
        if inner.state == BreakerState::HalfOpen && trial {
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    fn on_failure(&self, trial: bool, error: &DomainError) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        counter!("breaker_failures_total", "breaker" => self.name.clone()).increment(1);

        if trial {
            inner.trial_in_flight = false;
            warn!(breaker = %self.name, error = %error, "trial call failed, re-opening circuit");
            self.transition(&mut inner, BreakerState::Open);
            return;
        }

        if inner.state == BreakerState::Closed
            && inner.failure_count >= self.config.failure_threshold
        {
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                error = %error,
                "failure threshold reached, opening circuit"
            );
            self.transition(&mut inner, BreakerState::Open);
        } else {
            debug!(
                breaker = %self.name,
                failures = inner.failure_count,
                error = %error,
                "protected call failed"
            );
        }
    }

    fn abandon_trial(&self) {
        let mut inner = self.lock();
        inner.trial_in_flight = false;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        if inner.state == BreakerState::HalfOpen {
            warn!(breaker = %self.name, "trial call abandoned, re-opening circuit");
            self.transition(&mut inner, BreakerState::Open);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: BreakerState) {
        if inner.state == next {
            return;
        }
        info!(
            breaker = %self.name,
            from = inner.state.as_str(),
            to = next.as_str(),
            "circuit breaker transition"
        );
        if next == BreakerState::Closed {
            inner.failure_count = 0;
        }
        inner.state = next;
        counter!(
            "breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => next.as_str()
        )
        .increment(1);
    }
}

/// Re-opens the breaker if a half-open trial future is dropped before it
/// resolves, so the single trial slot cannot leak.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}
