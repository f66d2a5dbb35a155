//! Lightweight counters for coordinator and replica instrumentation

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for tracking event counts
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Coordinator-side counters
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub commits: Counter,
    pub aborts: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    /// Cache puts that replaced an existing entry
    pub cache_overwrites: Counter,
    pub phase2_retries: Counter,
    pub replica_read_failovers: Counter,
    pub inflight_transactions: Gauge,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CoordinatorMetricsSnapshot {
        CoordinatorMetricsSnapshot {
            commits: self.commits.get(),
            aborts: self.aborts.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            cache_overwrites: self.cache_overwrites.get(),
            phase2_retries: self.phase2_retries.get(),
            replica_read_failovers: self.replica_read_failovers.get(),
            inflight_transactions: self.inflight_transactions.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoordinatorMetricsSnapshot {
    pub commits: u64,
    pub aborts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_overwrites: u64,
    pub phase2_retries: u64,
    pub replica_read_failovers: u64,
    pub inflight_transactions: u64,
}
