// SPDX-License-Identifier: AGPL-3.0-or-later

//! Counters and monitor events (spec §3 "Counters (C8)", §4.6).

pub mod monitor;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub use monitor::{MonitorEvent, MonitorSink, TracingMonitor};

/// Monotonic link/application success/retry/fail counters, reset by the
/// caller between sessions.
#[derive(Debug, Default)]
pub struct Counters {
    pub app_succ: AtomicU32,
    pub app_retry: AtomicU32,
    pub app_fail: AtomicU32,
    pub link_succ: AtomicU32,
    pub link_retry: AtomicU32,
    pub link_fail: AtomicU32,
    pub round_trip: RoundTripStats,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.app_succ.store(0, Ordering::Relaxed);
        self.app_retry.store(0, Ordering::Relaxed);
        self.app_fail.store(0, Ordering::Relaxed);
        self.link_succ.store(0, Ordering::Relaxed);
        self.link_retry.store(0, Ordering::Relaxed);
        self.link_fail.store(0, Ordering::Relaxed);
        self.round_trip.reset();
    }
}

/// Round-trip timing: the span between the last byte of a written packet
/// and the first turn-around byte of the response (spec §4.6).
#[derive(Debug, Default)]
pub struct RoundTripStats {
    min_millis: AtomicU64,
    max_millis: AtomicU64,
    sum_millis: AtomicU64,
    count: AtomicU64,
}

/// Point-in-time read of [`RoundTripStats`]; `min`/`max`/`average` are
/// `None` until at least one sample has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoundTripSnapshot {
    pub min_millis: Option<u64>,
    pub max_millis: Option<u64>,
    pub average_millis: Option<u64>,
    pub count: u64,
}

impl RoundTripStats {
    pub fn record(&self, elapsed_millis: u64) {
        self.sum_millis.fetch_add(elapsed_millis, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        // `0` means "unset" per spec §4.6, so the first sample always wins
        // the min regardless of value.
        self.min_millis
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(if cur == 0 { elapsed_millis } else { cur.min(elapsed_millis) })
            })
            .ok();
        self.max_millis
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.max(elapsed_millis))
            })
            .ok();
    }

    pub fn reset(&self) {
        self.min_millis.store(0, Ordering::Relaxed);
        self.max_millis.store(0, Ordering::Relaxed);
        self.sum_millis.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RoundTripSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return RoundTripSnapshot::default();
        }
        let min = self.min_millis.load(Ordering::Relaxed);
        let max = self.max_millis.load(Ordering::Relaxed);
        let sum = self.sum_millis.load(Ordering::Relaxed);
        RoundTripSnapshot {
            min_millis: Some(min),
            max_millis: Some(max),
            average_millis: Some(sum / count),
            count,
        }
    }
}
