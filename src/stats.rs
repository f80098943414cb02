//! Per-connection statistics: a lock-free snapshot plus a pluggable mirror
//! to an external store, debounced the same way location updates are
//! debounced in the connection state machine.

use crate::message::GatewayIdentity;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub uplinks_received: u64,
    pub uplinks_forwarded: u64,
    pub downlinks_sent: u64,
    pub downlinks_succeeded: u64,
    pub downlinks_failed: u64,
    pub status_received: u64,
    pub last_round_trip: Option<Duration>,
}

/// Atomics behind a struct rather than a single `Mutex<StatsSnapshot>`: the
/// counters are on the hot path of every uplink/downlink, the round-trip
/// estimate is updated far less often and tolerates a small lock.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    uplinks_received: AtomicU64,
    uplinks_forwarded: AtomicU64,
    downlinks_sent: AtomicU64,
    downlinks_succeeded: AtomicU64,
    downlinks_failed: AtomicU64,
    status_received: AtomicU64,
    last_round_trip: Mutex<Option<Duration>>,
}

impl ConnectionStats {
    pub fn record_uplink_received(&self) {
        self.uplinks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uplink_forwarded(&self) {
        self.uplinks_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downlink_sent(&self) {
        self.downlinks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downlink_result(&self, success: bool) {
        if success {
            self.downlinks_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.downlinks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_status_received(&self) {
        self.status_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_trip(&self, rtt: Duration) {
        *self.last_round_trip.lock().unwrap() = Some(rtt);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uplinks_received: self.uplinks_received.load(Ordering::Relaxed),
            uplinks_forwarded: self.uplinks_forwarded.load(Ordering::Relaxed),
            downlinks_sent: self.downlinks_sent.load(Ordering::Relaxed),
            downlinks_succeeded: self.downlinks_succeeded.load(Ordering::Relaxed),
            downlinks_failed: self.downlinks_failed.load(Ordering::Relaxed),
            status_received: self.status_received.load(Ordering::Relaxed),
            last_round_trip: *self.last_round_trip.lock().unwrap(),
        }
    }
}

/// External sink a `Connection` mirrors its stats into. The backing store
/// itself is out of scope for this crate; `NoopStatsStore` is the default.
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn store(&self, gateway: &GatewayIdentity, snapshot: StatsSnapshot);
}

#[derive(Default)]
pub struct NoopStatsStore;

#[async_trait]
impl StatsStore for NoopStatsStore {
    async fn store(&self, _gateway: &GatewayIdentity, _snapshot: StatsSnapshot) {}
}

/// Gate deciding whether enough time has passed to mirror stats again.
/// Shared shape with the gateway-location debounce in `connection.rs`.
pub struct Debounce {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Debounce {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: Mutex::new(None) }
    }

    /// Returns true (and records `now`) if `interval` has elapsed since the
    /// last successful check, atomically with respect to concurrent callers.
    pub fn check(&self, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let stats = ConnectionStats::default();
        stats.record_uplink_received();
        stats.record_uplink_received();
        stats.record_downlink_result(true);
        stats.record_downlink_result(false);
        let snap = stats.snapshot();
        assert_eq!(snap.uplinks_received, 2);
        assert_eq!(snap.downlinks_succeeded, 1);
        assert_eq!(snap.downlinks_failed, 1);
    }

    #[test]
    fn debounce_blocks_until_interval_elapses() {
        let debounce = Debounce::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(debounce.check(t0));
        assert!(!debounce.check(t0 + Duration::from_secs(1)));
        assert!(debounce.check(t0 + Duration::from_secs(61)));
    }
}
