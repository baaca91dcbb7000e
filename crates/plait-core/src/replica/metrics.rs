//! Per-replica counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::queue::QueueKind;

/// Queue fill ratio (percent) above which a warning is logged.
pub const FILL_WARNING_PERCENT: usize = 80;

const FILL_WARNING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    ReceivedBroadcast,
    ReceivedSync,
    Fetched,
    FetchMisses,
    FetchErrors,
    Retries,
    DeadLetters,
    Abandoned,
    RepairSweeps,
}

const COUNTERS: usize = 9;

#[derive(Debug, Default)]
pub struct ReplicaMetrics {
    counters: [AtomicU64; COUNTERS],
    last_fill_warning: Mutex<Option<Instant>>,
}

impl ReplicaMetrics {
    pub(crate) fn bump(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// Sample a queue's fill level, warning at most once per second while
    /// any queue is above [`FILL_WARNING_PERCENT`].
    pub(crate) fn record_fill(&self, topic: &str, queue: QueueKind, used: usize, capacity: usize) {
        if capacity == 0 || used * 100 <= capacity * FILL_WARNING_PERCENT {
            return;
        }
        let now = Instant::now();
        let mut last = self.last_fill_warning.lock();
        if last.is_some_and(|at| now.duration_since(at) < FILL_WARNING_INTERVAL) {
            return;
        }
        *last = Some(now);
        warn!(topic, queue = queue.as_str(), used, capacity, "queue filling up");
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received_broadcast: self.get(Counter::ReceivedBroadcast),
            received_sync: self.get(Counter::ReceivedSync),
            fetched: self.get(Counter::Fetched),
            fetch_misses: self.get(Counter::FetchMisses),
            fetch_errors: self.get(Counter::FetchErrors),
            retries: self.get(Counter::Retries),
            dead_letters: self.get(Counter::DeadLetters),
            abandoned: self.get(Counter::Abandoned),
            repair_sweeps: self.get(Counter::RepairSweeps),
        }
    }
}

/// Point-in-time copy of [`ReplicaMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub received_broadcast: u64,
    pub received_sync: u64,
    pub fetched: u64,
    pub fetch_misses: u64,
    pub fetch_errors: u64,
    /// Retries scheduled after store or fetch failures.
    pub retries: u64,
    pub dead_letters: u64,
    pub abandoned: u64,
    pub repair_sweeps: u64,
}

impl std::ops::AddAssign for MetricsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.received_broadcast += other.received_broadcast;
        self.received_sync += other.received_sync;
        self.fetched += other.fetched;
        self.fetch_misses += other.fetch_misses;
        self.fetch_errors += other.fetch_errors;
        self.retries += other.retries;
        self.dead_letters += other.dead_letters;
        self.abandoned += other.abandoned;
        self.repair_sweeps += other.repair_sweeps;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_land_in_their_own_fields() {
        let metrics = ReplicaMetrics::default();
        metrics.bump(Counter::Fetched);
        metrics.bump(Counter::Fetched);
        metrics.bump(Counter::RepairSweeps);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fetched, 2);
        assert_eq!(snapshot.repair_sweeps, 1);
        assert_eq!(snapshot.abandoned, 0);
    }

    #[test]
    fn snapshots_add_up() {
        let mut total = MetricsSnapshot::default();
        total += MetricsSnapshot {
            dead_letters: 2,
            ..MetricsSnapshot::default()
        };
        total += MetricsSnapshot {
            dead_letters: 3,
            received_sync: 1,
            ..MetricsSnapshot::default()
        };
        assert_eq!(total.dead_letters, 5);
        assert_eq!(total.received_sync, 1);
    }

    #[test]
    fn fill_warning_is_throttled() {
        let metrics = ReplicaMetrics::default();
        metrics.record_fill("t", QueueKind::Links, 10, 200);
        assert!(metrics.last_fill_warning.lock().is_none());

        metrics.record_fill("t", QueueKind::Links, 190, 200);
        let first = *metrics.last_fill_warning.lock();
        assert!(first.is_some());

        metrics.record_fill("t", QueueKind::Receive, 20, 20);
        assert_eq!(*metrics.last_fill_warning.lock(), first);
    }
}
