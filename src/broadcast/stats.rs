use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use serde::Serialize;

pub const FRAMES_PULLED: &str = "framecast_frames_pulled";
pub const PULL_FAILURES: &str = "framecast_pull_failures";
pub const DELIVERIES: &str = "framecast_deliveries";
pub const DELIVERY_FAILURES: &str = "framecast_delivery_failures";
pub const CYCLE_OVERRUNS: &str = "framecast_cycle_overruns";
pub const CYCLE_TIME_US: &str = "framecast_cycle_time_us";

/// Counters updated by the broadcast thread, readable from anywhere
#[derive(Default)]
pub struct DaemonStats {
    cycles: CachePadded<AtomicU64>,
    frames_pulled: CachePadded<AtomicU64>,
    pull_failures: CachePadded<AtomicU64>,
    deliveries: CachePadded<AtomicU64>,
    delivery_failures: CachePadded<AtomicU64>,
    failures_dropped: CachePadded<AtomicU64>,
    overruns: CachePadded<AtomicU64>,
}

/// Point-in-time copy of [`DaemonStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub frames_pulled: u64,
    pub pull_failures: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    /// Failures not queued because the failure channel was full
    pub failures_dropped: u64,
    /// Cycles that took longer than one period
    pub overruns: u64,
}

impl DaemonStats {
    pub(crate) fn cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_pulled(&self) {
        self.frames_pulled.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(FRAMES_PULLED).increment(1);
    }

    pub(crate) fn pull_failed(&self) {
        self.pull_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(PULL_FAILURES).increment(1);
    }

    pub(crate) fn delivered(&self, count: usize) {
        self.deliveries.fetch_add(count as u64, Ordering::Relaxed);
        metrics::counter!(DELIVERIES).increment(count as u64);
    }

    pub(crate) fn delivery_failed(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(DELIVERY_FAILURES).increment(1);
    }

    pub(crate) fn failure_dropped(&self) {
        self.failures_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(CYCLE_OVERRUNS).increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            frames_pulled: self.frames_pulled.load(Ordering::Relaxed),
            pull_failures: self.pull_failures.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            failures_dropped: self.failures_dropped.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}
