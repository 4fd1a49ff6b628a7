// =============================================================================
// Circuit breaker — three-state gate around remote calls (C5)
// =============================================================================
//
// Grounded on `dawsh2-Torq/services/adapters/src/circuit_breaker.rs`'s
// closed/open/half-open state machine, generalized with an observer
// callback (§4.5) and the rule that rate-limit errors never count as
// failures.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{ConnectorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub max_failures: u32,
    pub open_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            open_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

/// Observer callback fired on every state transition (§4.5).
pub type StateChangeObserver = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    observer: Option<StateChangeObserver>,
}

/// Snapshot for introspection (§6 `CircuitStats()`).
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub time_to_half_open: Option<Duration>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: StateChangeObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    fn transition(&self, to: CircuitState) {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            *state = to;
            from
        };
        if from != to {
            match to {
                CircuitState::Open => warn!(?from, ?to, "circuit breaker state change"),
                _ => info!(?from, ?to, "circuit breaker state change"),
            }
            if let Some(observer) = &self.observer {
                observer(from, to);
            }
        }
    }

    /// Check admission and, if the breaker is open, flip to half-open once
    /// `open_timeout` has elapsed. Called before every guarded operation.
    fn admit(&self) -> Result<()> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = self.opened_at.read().map(|t| t.elapsed());
                if let Some(elapsed) = elapsed {
                    if elapsed >= self.config.open_timeout {
                        self.success_count.store(0, Ordering::Relaxed);
                        self.transition(CircuitState::HalfOpen);
                        return Ok(());
                    }
                    let remaining = self.config.open_timeout.saturating_sub(elapsed);
                    return Err(ConnectorError::CircuitOpen {
                        time_to_half_open: remaining,
                    });
                }
                Err(ConnectorError::CircuitOpen {
                    time_to_half_open: self.config.open_timeout,
                })
            }
        }
    }

    fn record_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.config.success_threshold {
                    self.failure_count.store(0, Ordering::Relaxed);
                    self.success_count.store(0, Ordering::Relaxed);
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                *self.opened_at.write() = Some(Instant::now());
                self.transition(CircuitState::Open);
            }
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.max_failures {
                    *self.opened_at.write() = Some(Instant::now());
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Execute `op` through the breaker. Admission failures short-circuit
    /// without running `op`; §4.5 "Rate-limit errors do not count as
    /// failures" — `ConnectorError::counts_as_failure` decides that.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if err.counts_as_failure() {
                    self.record_failure();
                }
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> CircuitStats {
        let state = self.state();
        let time_to_half_open = if state == CircuitState::Open {
            self.opened_at
                .read()
                .map(|t| self.config.open_timeout.saturating_sub(t.elapsed()))
        } else {
            None
        };
        CircuitStats {
            state,
            failure_count: self.failure_count.load(Ordering::Relaxed),
            time_to_half_open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::sleep;

    fn ok() -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async { Ok(()) })
    }
    fn fail() -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async {
            Err(ConnectorError::Connection {
                message: "boom".to_string(),
                temporary: true,
            })
        })
    }
    fn rate_limited() -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async {
            Err(ConnectorError::RateLimit {
                retry_after: Duration::from_millis(10),
            })
        })
    }

    #[tokio::test]
    async fn full_cycle_matches_spec_scenario_2() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 3,
            success_threshold: 2,
            open_timeout: Duration::from_millis(200),
        });

        for _ in 0..3 {
            let _ = breaker.execute(|| fail()).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.execute(|| ok()).await.unwrap_err();
        match err {
            ConnectorError::CircuitOpen { time_to_half_open } => {
                assert!(time_to_half_open > Duration::ZERO);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }

        sleep(Duration::from_millis(220)).await;

        breaker.execute(|| ok()).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.execute(|| ok()).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn rate_limit_errors_do_not_count_as_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 2,
            success_threshold: 1,
            open_timeout: Duration::from_millis(50),
        });

        for _ in 0..10 {
            let _ = breaker.execute(|| rate_limited()).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 1,
            success_threshold: 2,
            open_timeout: Duration::from_millis(10),
        });
        let _ = breaker.execute(|| fail()).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        sleep(Duration::from_millis(20)).await;
        let _ = breaker.execute(|| fail()).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn observer_fires_on_state_changes() {
        let transitions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let t2 = transitions.clone();
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 1,
            success_threshold: 1,
            open_timeout: Duration::from_millis(10),
        })
        .with_observer(Box::new(move |from, to| {
            t2.lock().push((from, to));
        }));

        let _ = breaker.execute(|| fail()).await;
        assert_eq!(transitions.lock().as_slice(), &[(CircuitState::Closed, CircuitState::Open)]);
    }
}
