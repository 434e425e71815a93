//! CircuitBreaker - fail fast around a failing dependency
//!
//! ## Responsibilities
//!
//! - Count consecutive failures; open at `failure_threshold`
//! - Reject calls without invoking the dependency while open
//! - After `reset_timeout`, admit exactly one trial call (half-open)
//! - Trial success closes the breaker, trial failure re-opens it
//!
//! Wraps per-batch processing in the engine and source reopen attempts in
//! the capture loop.

use crate::config_store::BreakerConfig;
use crate::error::{Error, Result};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_secs(config.reset_timeout_secs),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Ask to make one call. The returned permit must be resolved with
    /// `success()` or `failure()`; dropping it unresolved counts as neither.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner);

        match inner.state {
            BreakerState::Closed => Ok(CallPermit::new(self, false)),
            BreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                tracing::info!(breaker = %self.name, "Circuit half-open, admitting trial call");
                Ok(CallPermit::new(self, true))
            }
            _ => Err(Error::CircuitOpen(self.name.clone())),
        }
    }

    /// Run `f` under the breaker
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        if inner.state != BreakerState::Closed {
            tracing::info!(breaker = %self.name, "Circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let reopen = inner.state == BreakerState::HalfOpen
            || (inner.state == BreakerState::Closed
                && inner.consecutive_failures >= self.failure_threshold);
        if reopen {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                reset_timeout_ms = self.reset_timeout.as_millis() as u64,
                "Circuit opened"
            );
        }
    }

    fn on_abandon(&self, trial: bool) {
        if trial {
            self.lock().trial_in_flight = false;
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            let elapsed = inner.opened_at.map_or(true, |at| at.elapsed() >= self.reset_timeout);
            if elapsed {
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = false;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Admission for one call
#[must_use]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandon(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn failing(calls: &AtomicU32) -> Result<()> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Internal("dependency down".into()))
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(breaker.call(|| failing(&calls)).await.is_err());
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        for _ in 0..5 {
            let err = breaker.call(|| failing(&calls)).await.unwrap_err();
            assert!(matches!(err, Error::CircuitOpen(_)));
        }
        // dependency not invoked while open
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_half_open_admits_exactly_one_trial() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(30));
        let calls = AtomicU32::new(0);
        let _ = breaker.call(|| failing(&calls)).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(breaker.try_acquire().is_err());

        trial.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_trial_failure_reopens() {
        let breaker = CircuitBreaker::new("test", 2, Duration::from_millis(30));
        let calls = AtomicU32::new(0);
        let _ = breaker.call(|| failing(&calls)).await;
        let _ = breaker.call(|| failing(&calls)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(breaker.call(|| failing(&calls)).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let _ = breaker.call(|| failing(&calls)).await;
        let _ = breaker.call(|| failing(&calls)).await;
        breaker.call(|| async { Ok(()) }).await.unwrap();
        let _ = breaker.call(|| failing(&calls)).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_trial_frees_slot() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));
        let calls = AtomicU32::new(0);
        let _ = breaker.call(|| failing(&calls)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        drop(breaker.try_acquire().unwrap());
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_from_config_defaults() {
        let breaker = CircuitBreaker::from_config("batches", &BreakerConfig::default());
        assert_eq!(breaker.name(), "batches");
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.reset_timeout, Duration::from_secs(60));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
