//! Fail-fast gate shared by database-bound calls.
//!
//! Counter semantics: consecutive failures open the breaker at `threshold`;
//! any call arriving after `reset_after` of quiet closes it again in one
//! step (no half-open probe phase).  The breaker never retries the wrapped
//! operation.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::warn;

use crate::metrics::Metrics;
use crate::repo::RepoError;

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit breaker {0} is open")]
    Open(&'static str),
    #[error("circuit breaker {0} call timed out")]
    Timeout(&'static str),
    #[error(transparent)]
    Repo(RepoError),
}

pub struct CircuitBreaker {
    name: &'static str,
    threshold: u32,
    call_timeout: Duration,
    reset_after: Duration,
    failures: AtomicU32,
    /// Milliseconds since `epoch`; 0 means "never failed".
    last_failure_ms: AtomicU64,
    epoch: Instant,
    metrics: Arc<Metrics>,
}

impl CircuitBreaker {
    pub fn new(
        name: &'static str,
        threshold: u32,
        call_timeout: Duration,
        reset_after: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        metrics.set_breaker_open(name, false);
        Self {
            name,
            threshold,
            call_timeout,
            reset_after,
            failures: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            metrics,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs `op` under the breaker.  `RepoError::NotFound` is benign and
    /// never counts as a failure.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RepoError>>,
    {
        if self.reject() {
            return Err(BreakerError::Open(self.name));
        }
        match timeout(self.call_timeout, op()).await {
            Err(_) => {
                self.record_failure();
                Err(BreakerError::Timeout(self.name))
            }
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                if !e.is_not_found() {
                    self.record_failure();
                }
                Err(BreakerError::Repo(e))
            }
        }
    }

    /// Like [`call`](Self::call), but an open breaker yields
    /// `fallback()` instead of an error.
    pub async fn call_or_else<T, F, Fut, FB>(&self, op: F, fallback: FB) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RepoError>>,
        FB: FnOnce() -> T,
    {
        if self.reject() {
            return Ok(fallback());
        }
        self.call(op).await
    }

    pub fn is_open(&self) -> bool {
        if self.failures.load(Ordering::SeqCst) < self.threshold {
            return false;
        }
        let last_ms = self.last_failure_ms.load(Ordering::SeqCst);
        Instant::now().duration_since(self.epoch) <= Duration::from_millis(last_ms) + self.reset_after
    }

    fn reject(&self) -> bool {
        if self.failures.load(Ordering::SeqCst) < self.threshold {
            return false;
        }
        let last_ms = self.last_failure_ms.load(Ordering::SeqCst);
        let since_failure =
            Instant::now().duration_since(self.epoch) - Duration::from_millis(last_ms);
        if since_failure > self.reset_after {
            // Quiet period elapsed: close in one step.
            self.failures.store(0, Ordering::SeqCst);
            self.metrics.set_breaker_open(self.name, false);
            return false;
        }
        true
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.metrics.set_breaker_open(self.name, false);
    }

    fn record_failure(&self) {
        let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        let now_ms = Instant::now().duration_since(self.epoch).as_millis() as u64;
        self.last_failure_ms.store(now_ms, Ordering::SeqCst);
        if count >= self.threshold {
            warn!(breaker = self.name, failures = count, "circuit breaker open");
            self.metrics.set_breaker_open(self.name, true);
        }
    }
}
