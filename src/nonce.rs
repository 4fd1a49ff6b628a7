// =============================================================================
// Nonce generator — monotonic millisecond timestamps with tie-breaking (C3)
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::ClockSync;

/// Produces strictly increasing millisecond nonces even across
/// sub-millisecond bursts (§4.3): if `now_ms <= last`, emit `last + 1`.
pub struct NonceGenerator {
    clock: Arc<ClockSync>,
    last: Mutex<i64>,
}

impl NonceGenerator {
    pub fn new(clock: Arc<ClockSync>) -> Self {
        Self {
            clock,
            last: Mutex::new(0),
        }
    }

    pub fn next(&self) -> i64 {
        let now_ms = self.clock.now().timestamp_millis();
        let mut last = self.last.lock();
        let nonce = if now_ms <= *last { *last + 1 } else { now_ms };
        *last = nonce;
        nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockSource, ClockSyncConfig};
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FixedClock(AtomicI64);
    impl ClockSource for FixedClock {
        fn local_now_ms(&self) -> i64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn nonces_strictly_increase_under_burst() {
        let clock = Arc::new(ClockSync::new(
            Arc::new(FixedClock(AtomicI64::new(1000))),
            ClockSyncConfig::default(),
        ));
        let gen = NonceGenerator::new(clock);

        let mut prev = gen.next();
        for _ in 0..1000 {
            let n = gen.next();
            assert!(n > prev, "nonce must strictly increase: {n} <= {prev}");
            prev = n;
        }
    }

    #[test]
    fn nonce_tracks_advancing_clock() {
        let clock_source = Arc::new(FixedClock(AtomicI64::new(1000)));
        let clock = Arc::new(ClockSync::new(clock_source.clone(), ClockSyncConfig::default()));
        let gen = NonceGenerator::new(clock);

        let first = gen.next();
        assert_eq!(first, 1000);
        clock_source.0.store(5000, Ordering::Relaxed);
        let second = gen.next();
        assert_eq!(second, 5000);
    }
}
