//! Failure-ratio circuit breaker for database writes
//!
//! ```text
//! closed --(requests >= min && failures/requests >= ratio)--> open
//! open --(cooldown elapsed)--> half-open
//! half-open --(trial successes)--> closed
//! half-open --(any failure)--> open
//! ```
//!
//! Closed-state counts reset at every window boundary. Each transition starts
//! a new generation; outcomes from calls admitted in an older generation are
//! dropped so a slow call cannot reopen a breaker that already recovered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsReporter;

/// Retry hint given when half-open trial slots are all taken
const HALF_OPEN_BUSY_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts {
    requests: u32,
    successes: u32,
    failures: u32,
    consecutive_successes: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.successes += 1;
        self.consecutive_successes += 1;
    }

    fn on_failure(&mut self) {
        self.failures += 1;
        self.consecutive_successes = 0;
    }
}

struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    /// Window end while closed, cooldown end while open
    expiry: Option<Instant>,
}

/// Read-only view for health endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub requests: u32,
    pub failures: u32,
    pub successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    metrics: Arc<MetricsReporter>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        metrics: Arc<MetricsReporter>,
    ) -> Self {
        let expiry = Some(Instant::now() + config.window);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
            metrics,
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        let retry_after_ms = match (inner.state, inner.expiry) {
            (BreakerState::Open, Some(expiry)) => {
                Some(u64::try_from(expiry.saturating_duration_since(now).as_millis()).unwrap_or(u64::MAX))
            }
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            requests: inner.counts.requests,
            failures: inner.counts.failures,
            successes: inner.counts.successes,
            retry_after_ms,
        }
    }

    /// Run `operation` if the breaker admits it and record its outcome.
    ///
    /// Returns `CircuitOpen` without polling `operation` when the breaker is
    /// open or half-open with no free trial slot. Only errors for which
    /// [`Error::is_infrastructure_failure`] holds count as failures. If the
    /// returned future is dropped before completion the call is forgotten.
    pub async fn call<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let generation = self.before_call()?;
        let mut pending = PendingCall {
            breaker: self,
            generation,
            settled: false,
        };
        let result = operation.await;
        pending.settled = true;
        let failed = result
            .as_ref()
            .err()
            .is_some_and(Error::is_infrastructure_failure);
        self.after_call(generation, !failed);
        result
    }

    fn before_call(&self) -> Result<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            BreakerState::Open => {
                self.metrics.record_breaker_rejection();
                let retry_after = inner
                    .expiry
                    .map_or(self.config.cooldown, |expiry| expiry.saturating_duration_since(now));
                return Err(Error::CircuitOpen { retry_after });
            }
            BreakerState::HalfOpen if inner.counts.requests >= self.config.half_open_max_calls => {
                self.metrics.record_breaker_rejection();
                return Err(Error::CircuitOpen {
                    retry_after: HALF_OPEN_BUSY_RETRY_AFTER,
                });
            }
            _ => {}
        }

        inner.counts.requests += 1;
        Ok(inner.generation)
    }

    fn after_call(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        if success {
            inner.counts.on_success();
            if inner.state == BreakerState::HalfOpen
                && inner.counts.consecutive_successes >= self.config.half_open_max_calls
            {
                self.transition(&mut inner, BreakerState::Closed, now);
            }
            return;
        }

        inner.counts.on_failure();
        match inner.state {
            BreakerState::Closed if self.ready_to_trip(inner.counts) => {
                self.transition(&mut inner, BreakerState::Open, now);
            }
            BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open, now),
            _ => {}
        }
    }

    fn abandon(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.counts.requests = inner.counts.requests.saturating_sub(1);
        }
    }

    fn ready_to_trip(&self, counts: Counts) -> bool {
        if counts.requests < self.config.min_requests {
            return false;
        }
        f64::from(counts.failures) / f64::from(counts.requests) >= self.config.failure_ratio
    }

    /// Apply time-driven changes: window rollover and cooldown expiry.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match (inner.state, inner.expiry) {
            (BreakerState::Closed, Some(expiry)) if expiry <= now => {
                self.new_generation(inner, now);
            }
            (BreakerState::Open, Some(expiry)) if expiry <= now => {
                self.transition(inner, BreakerState::HalfOpen, now);
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        self.new_generation(inner, now);

        match to {
            BreakerState::Open => {
                self.metrics.record_breaker_trip();
                tracing::warn!(
                    breaker = %self.name,
                    %from,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Circuit breaker opened"
                );
            }
            BreakerState::HalfOpen => {
                tracing::info!(breaker = %self.name, "Circuit breaker half-open; admitting trial calls");
            }
            BreakerState::Closed => {
                tracing::info!(breaker = %self.name, %from, "Circuit breaker closed");
            }
        }
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            BreakerState::Closed => Some(now + self.config.window),
            BreakerState::Open => Some(now + self.config.cooldown),
            BreakerState::HalfOpen => None,
        };
    }
}

/// Releases the admission slot of a call whose future was dropped.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon(self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "writes",
            BreakerConfig::default(),
            Arc::new(MetricsReporter::new(1)),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(async { Err::<(), _>(Error::Transient("connection reset".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.call(async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_three_failures() {
        let breaker = breaker();
        for _ in 0..2 {
            assert!(fail(&breaker).await.is_err());
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.metrics.breaker_trips(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_fast_without_running_operation() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        let ran = AtomicU32::new(0);
        let result = breaker
            .call(async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        match result {
            Err(Error::CircuitOpen { retry_after }) => {
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::from_secs(59));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.metrics.snapshot().breaker_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ratio_below_threshold_stays_closed() {
        let breaker = breaker();
        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        // 2 of 4 = 0.5 < 0.6
        assert_eq!(breaker.state(), BreakerState::Closed);
        let _ = fail(&breaker).await;
        // 3 of 5 = 0.6
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn window_rollover_clears_counts() {
        let breaker = breaker();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn business_errors_do_not_trip() {
        let breaker = breaker();
        for _ in 0..5 {
            let result = breaker
                .call(async {
                    Err::<(), _>(Error::Constraint("user id mismatch".into()))
                })
                .await;
            assert!(matches!(result, Err(Error::Constraint(_))));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.metrics.breaker_trips(), 2);
        assert!(breaker.snapshot().retry_after_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial_at_a_time() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let trial = breaker.call(async {
            let _ = wait.await;
            Ok(())
        });
        tokio::pin!(trial);
        assert!(futures_poll_once(trial.as_mut()).await.is_none());

        let second = succeed(&breaker).await;
        assert!(matches!(second, Err(Error::CircuitOpen { .. })));

        release.send(()).unwrap();
        trial.await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_its_slot() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        let trial = breaker.call(std::future::pending::<Result<()>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), trial).await;
        assert!(timed_out.is_err());

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    async fn futures_poll_once<F: Future + Unpin>(future: F) -> Option<F::Output> {
        let mut future = future;
        std::future::poll_fn(|cx| {
            std::task::Poll::Ready(match std::pin::Pin::new(&mut future).poll(cx) {
                std::task::Poll::Ready(value) => Some(value),
                std::task::Poll::Pending => None,
            })
        })
        .await
    }
}
