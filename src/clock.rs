// =============================================================================
// Clock sync — signed offset between local and exchange server time (C2)
// =============================================================================
//
// `now()` is the only clock signing layers are allowed to query. Raw local
// time never reaches a signature.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::error::{ConnectorError, Result};

/// Anything that can tell us the current time, replaceable in tests.
pub trait ClockSource: Send + Sync {
    fn local_now_ms(&self) -> i64;
}

/// The system clock, used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn local_now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Anything that can fetch the venue's server time, for clock sync.
/// Implemented by the REST pipeline's uncircuited `server_time` endpoint.
#[async_trait::async_trait]
pub trait ServerTimeSource: Send + Sync {
    async fn server_time_ms(&self) -> Result<i64>;
}

/// Configuration for `ClockSync` (§6 `clock.*`).
#[derive(Debug, Clone, Copy)]
pub struct ClockSyncConfig {
    pub max_offset: Duration,
    pub sync_interval: Duration,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            max_offset: Duration::from_millis(500),
            sync_interval: Duration::from_secs(300),
        }
    }
}

/// Maintains the signed millisecond offset between local and exchange
/// server time (§4.2). Stored as an atomic so `now()` never takes a lock.
pub struct ClockSync {
    offset_ms: AtomicI64,
    clock: Arc<dyn ClockSource>,
    config: ClockSyncConfig,
}

impl ClockSync {
    pub fn new(clock: Arc<dyn ClockSource>, config: ClockSyncConfig) -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            clock,
            config,
        }
    }

    /// Current best estimate of exchange server time.
    pub fn now(&self) -> DateTime<Utc> {
        let local = self.clock.local_now_ms();
        let offset = self.offset_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(local + offset)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Current offset in milliseconds (§6 Introspection: `ClockOffset()`).
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Run one sync round-trip against `source` (§4.2).
    ///
    /// Records `t_before`, fetches server time, records `t_after`, and sets
    /// `offset := server_time - (t_before + t_after) / 2`. Returns
    /// `ClockSyncError` if the resulting offset exceeds `max_offset` — the
    /// caller (the connector's clock-sync task) is responsible for retrying
    /// with backoff and surfacing the error via `OnError`.
    pub async fn sync_once(&self, source: &dyn ServerTimeSource) -> Result<i64> {
        let t_before = self.clock.local_now_ms();
        let server_time = source.server_time_ms().await?;
        let t_after = self.clock.local_now_ms();

        let offset = server_time - (t_before + t_after) / 2;
        let max = self.config.max_offset.as_millis() as i64;

        if offset.abs() > max {
            warn!(offset_ms = offset, max_offset_ms = max, "clock sync exceeded max offset");
            return Err(ConnectorError::ClockSync {
                offset_ms: offset,
                max_offset_ms: max,
            });
        }

        self.offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "clock sync updated offset");
        Ok(offset)
    }

    pub fn sync_interval(&self) -> Duration {
        self.config.sync_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64 as AI64;

    struct FixedClock(AI64);
    impl ClockSource for FixedClock {
        fn local_now_ms(&self) -> i64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    struct FixedServer(i64);
    #[async_trait::async_trait]
    impl ServerTimeSource for FixedServer {
        async fn server_time_ms(&self) -> Result<i64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn sync_sets_offset_within_threshold() {
        let clock = Arc::new(FixedClock(AI64::new(1_000_000)));
        let sync = ClockSync::new(clock, ClockSyncConfig::default());
        let server = FixedServer(1_000_100);
        let offset = sync.sync_once(&server).await.unwrap();
        assert_eq!(offset, 100);
        assert_eq!(sync.offset_ms(), 100);
    }

    #[tokio::test]
    async fn sync_fails_when_drift_exceeds_max() {
        let clock = Arc::new(FixedClock(AI64::new(1_000_000)));
        let sync = ClockSync::new(
            clock,
            ClockSyncConfig {
                max_offset: Duration::from_millis(500),
                sync_interval: Duration::from_secs(300),
            },
        );
        let server = FixedServer(1_000_000 + 10_000);
        let err = sync.sync_once(&server).await.unwrap_err();
        assert!(matches!(err, ConnectorError::ClockSync { .. }));
        // A failed sync must not clobber the previous good offset.
        assert_eq!(sync.offset_ms(), 0);
    }

    #[tokio::test]
    async fn now_reflects_current_offset() {
        let clock = Arc::new(FixedClock(AI64::new(5_000)));
        let sync = ClockSync::new(clock, ClockSyncConfig::default());
        let server = FixedServer(5_050);
        sync.sync_once(&server).await.unwrap();
        assert_eq!(sync.now().timestamp_millis(), 5_050);
    }
}
