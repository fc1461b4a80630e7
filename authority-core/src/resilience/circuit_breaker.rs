//! Per-dependency circuit breaker (spec §4.H): closed/open/half-open state
//! machine guarding calls into the mandate store, mandate cache, and event
//! bus. When open, the guarded call fails fast with
//! [`CircuitOpenError`] rather than waiting on a dependency the breaker has
//! already given up on; the authority engine turns that into
//! `DenialReason::DownstreamUnavailable` (spec §4.E, §7's fail-closed
//! guarantee).

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

/// The three states of a single circuit breaker (spec §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through normally.
    Closed,
    /// Calls fail fast without reaching the dependency.
    Open,
    /// A bounded number of probe calls are allowed through to test recovery.
    HalfOpen,
}

/// Tunable thresholds for one breaker (spec §4.H defaults).
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before tripping to `Open`.
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` before closing.
    pub success_threshold: u32,
    /// How long `Open` holds before allowing a half-open probe.
    pub open_timeout: Duration,
    /// Maximum concurrent in-flight probes while `HalfOpen`.
    pub half_open_concurrency: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            half_open_concurrency: 1,
        }
    }
}

/// The guarded call was rejected because the breaker is open (or half-open
/// with no free probe slot).
#[derive(Debug, Error)]
#[error("circuit breaker {name} is open")]
pub struct CircuitOpenError {
    /// The breaker's configured name, for logging/metrics.
    pub name: String,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// A single named circuit breaker. Cheap to clone-share via `Arc` at wiring
/// time (spec §9: "explicit middleware composed once at wiring time").
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    consecutive_successes: AtomicU32,
    half_open_in_flight: AtomicUsize,
}

impl CircuitBreaker {
    /// Create a breaker with the given name (used in logs/metrics) and
    /// config.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            consecutive_successes: AtomicU32::new(0),
            half_open_in_flight: AtomicUsize::new(0),
        }
    }

    /// Current state, transitioning `Open` -> `HalfOpen` first if the
    /// configured timeout has elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_time_out(&mut inner);
        inner.state
    }

    fn maybe_time_out(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.open_timeout {
                    inner.state = BreakerState::HalfOpen;
                    self.consecutive_successes.store(0, Ordering::SeqCst);
                    self.half_open_in_flight.store(0, Ordering::SeqCst);
                    tracing::debug!(breaker = %self.name, "circuit breaker half-open probe window opened");
                }
            }
        }
    }

    /// Run `f`, recording success/failure against the breaker. Rejects
    /// immediately with [`CircuitOpenError`] if the breaker is open, or
    /// half-open with no free probe slot.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallOutcome<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().unwrap();
            self.maybe_time_out(&mut inner);
            match inner.state {
                BreakerState::Open => {
                    return Err(CallOutcome::Rejected(CircuitOpenError {
                        name: self.name.clone(),
                    }))
                }
                BreakerState::HalfOpen => {
                    let in_flight = self.half_open_in_flight.fetch_add(1, Ordering::SeqCst);
                    if in_flight >= self.config.half_open_concurrency {
                        self.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
                        return Err(CallOutcome::Rejected(CircuitOpenError {
                            name: self.name.clone(),
                        }));
                    }
                }
                BreakerState::Closed => {}
            }
        }

        let result = f().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result.map_err(CallOutcome::Failed)
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                self.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
                let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    tracing::info!(breaker = %self.name, "circuit breaker closed after probe successes");
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(breaker = %self.name, "circuit breaker tripped open");
                }
            }
            BreakerState::HalfOpen => {
                self.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(breaker = %self.name, "circuit breaker reopened after probe failure");
            }
            BreakerState::Open => {}
        }
    }

    /// The breaker's configured name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of a breaker-guarded call: either the breaker rejected the call
/// outright, or the call ran and failed with the wrapped error type.
#[derive(Debug, Error)]
pub enum CallOutcome<E> {
    /// The breaker was open (or out of half-open probe slots).
    #[error(transparent)]
    Rejected(#[from] CircuitOpenError),
    /// The call ran and returned an error.
    #[error("guarded call failed: {0}")]
    Failed(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            open_timeout: Duration::from_millis(20),
            half_open_concurrency: 1,
        }
    }

    #[tokio::test]
    async fn trips_open_after_threshold_failures() {
        let breaker = CircuitBreaker::new("store", config());
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), &str>("boom") })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        let result = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CallOutcome::Rejected(_))));
    }

    #[tokio::test]
    async fn half_open_then_closed_after_successes() {
        let breaker = CircuitBreaker::new("cache", config());
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), &str>("boom") })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        for _ in 0..2 {
            breaker.call(|| async { Ok::<_, &str>(()) }).await.unwrap();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("bus", config());
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), &str>("boom") })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let _ = breaker.call(|| async { Err::<(), &str>("still broken") }).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
