// =============================================================================
// Rate limiter — weighted token bucket and per-endpoint buckets (C4)
// =============================================================================
//
// An admission gate, not just an observer: `wait()` blocks (honoring
// cancellation) until enough tokens refill; `allow()` probes without
// blocking. `observe_used_weight` additionally reconciles the bucket
// against the venue's own header-reported usage after each call.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{ConnectorError, Result};

/// A smoothly-refilling weighted token bucket (§4.4 "Weighted bucket").
pub struct WeightedBucket {
    max_weight: u32,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
    notify: Notify,
    used_weight_observed: AtomicU32,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl WeightedBucket {
    /// `max_weight` tokens refill smoothly over one minute (§4.4).
    pub fn new(max_weight: u32) -> Self {
        Self {
            max_weight,
            refill_per_sec: max_weight as f64 / 60.0,
            state: Mutex::new(BucketState {
                tokens: max_weight as f64,
                last_refill: Instant::now(),
            }),
            notify: Notify::new(),
            used_weight_observed: AtomicU32::new(0),
        }
    }

    fn refill_locked(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.max_weight as f64);
            state.last_refill = Instant::now();
        }
    }

    /// Non-blocking admission check (§4.4 `allow(weight)`).
    pub fn allow(&self, weight: u32) -> bool {
        if weight == 0 {
            return true;
        }
        let mut state = self.state.lock();
        self.refill_locked(&mut state);
        if state.tokens >= weight as f64 {
            state.tokens -= weight as f64;
            true
        } else {
            false
        }
    }

    /// Blocking admission (§4.4 `wait(weight, ctx)`, the default backpressure
    /// path). Weight 0 is a no-op; weight exceeding capacity is a structured
    /// error (§8 boundary behaviors) since it could never be admitted.
    pub async fn wait(&self, weight: u32, cancel: &tokio_util::sync::CancellationToken) -> Result<()> {
        if weight == 0 {
            return Ok(());
        }
        if weight > self.max_weight {
            return Err(ConnectorError::Validation {
                field: "weight".to_string(),
                value: weight.to_string(),
                constraint: format!("exceeds bucket capacity {}", self.max_weight),
            });
        }

        loop {
            if self.allow(weight) {
                return Ok(());
            }

            let deficit = {
                let mut state = self.state.lock();
                self.refill_locked(&mut state);
                (weight as f64 - state.tokens).max(0.0)
            };
            let wait_for = Duration::from_secs_f64((deficit / self.refill_per_sec).max(0.01));

            tokio::select! {
                _ = tokio::time::sleep(wait_for) => {}
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => {
                    return Err(ConnectorError::Canceled);
                }
            }
        }
    }

    /// Reconcile the observability-only used-weight counter from a venue
    /// response header. The bucket itself remains authoritative for
    /// admission (§4.4).
    pub fn observe_used_weight(&self, used: u32) {
        self.used_weight_observed.store(used, Ordering::Relaxed);
        debug!(used_weight = used, "rate limiter observed venue-reported usage");
    }

    pub fn used_weight_observed(&self) -> u32 {
        self.used_weight_observed.load(Ordering::Relaxed)
    }
}

/// A map from endpoint key to its own token bucket (§4.4 "Per-endpoint
/// bucket"); the most restrictive relevant bucket bounds each call.
pub struct PerEndpointBuckets {
    buckets: Mutex<HashMap<String, WeightedBucket>>,
}

impl PerEndpointBuckets {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the bucket for `endpoint`.
    pub fn configure(&self, endpoint: &str, max_per_minute: u32) {
        self.buckets
            .lock()
            .insert(endpoint.to_string(), WeightedBucket::new(max_per_minute));
    }

    /// Wait on the bucket for `endpoint`, or admit immediately if no bucket
    /// is configured for it.
    pub async fn wait(
        &self,
        endpoint: &str,
        weight: u32,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<()> {
        // Buckets are not `Send` across the lock guard into `.await`, so we
        // drop the guard before waiting; `WeightedBucket`'s own interior
        // mutability handles concurrent callers safely.
        let bucket_exists = self.buckets.lock().contains_key(endpoint);
        if !bucket_exists {
            return Ok(());
        }
        // SAFETY-FREE approach: buckets live for the duration of the
        // connector, so borrowing through a short lock to get a reference
        // is not possible without unsafe; instead we re-lock per poll.
        loop {
            let ready = {
                let guard = self.buckets.lock();
                let bucket = guard.get(endpoint).expect("checked above");
                bucket.allow(weight)
            };
            if ready {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = cancel.cancelled() => {
                    warn!(endpoint, "per-endpoint rate-limit wait canceled");
                    return Err(ConnectorError::Canceled);
                }
            }
        }
    }
}

impl Default for PerEndpointBuckets {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn weight_zero_is_a_no_op() {
        let bucket = WeightedBucket::new(2);
        let cancel = CancellationToken::new();
        bucket.wait(0, &cancel).await.unwrap();
        // Still full afterwards.
        assert!(bucket.allow(2));
    }

    #[tokio::test]
    async fn weight_over_capacity_is_structured_error() {
        let bucket = WeightedBucket::new(2);
        let cancel = CancellationToken::new();
        let err = bucket.wait(10, &cancel).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Validation { .. }));
    }

    #[tokio::test]
    async fn backpressure_scenario_from_spec() {
        // §8 scenario 1: max_weight=2 refilling at 1/s; three weight-1
        // requests at t=0. First two succeed immediately; the third must
        // wait for a token to refill (~1s) rather than error out.
        let bucket = WeightedBucket {
            max_weight: 2,
            refill_per_sec: 1.0,
            state: Mutex::new(BucketState {
                tokens: 2.0,
                last_refill: Instant::now(),
            }),
            notify: Notify::new(),
            used_weight_observed: AtomicU32::new(0),
        };
        let cancel = CancellationToken::new();

        let t0 = Instant::now();
        bucket.wait(1, &cancel).await.unwrap();
        bucket.wait(1, &cancel).await.unwrap();
        assert!(t0.elapsed() < Duration::from_millis(100), "first two admit immediately");

        bucket.wait(1, &cancel).await.unwrap();
        assert!(t0.elapsed() >= Duration::from_millis(500), "third waits for refill");
    }

    #[tokio::test]
    async fn wait_honors_cancellation() {
        let bucket = WeightedBucket::new(1);
        assert!(bucket.allow(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bucket.wait(1, &cancel).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Canceled));
    }
}
