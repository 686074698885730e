use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters tracked across the scheduler's lifetime.
#[derive(Debug, Default)]
pub struct SchedMetrics {
    pub tasks_scheduled: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub windows_sent: AtomicU64,
    pub windows_compacted: AtomicU64,
    pub match_passes: AtomicU64,
    pub workers_added: AtomicU64,
    pub workers_dropped: AtomicU64,
}

impl SchedMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_scheduled: self.tasks_scheduled.load(Ordering::Acquire),
            tasks_completed: self.tasks_completed.load(Ordering::Acquire),
            tasks_failed: self.tasks_failed.load(Ordering::Acquire),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Acquire),
            windows_sent: self.windows_sent.load(Ordering::Acquire),
            windows_compacted: self.windows_compacted.load(Ordering::Acquire),
            match_passes: self.match_passes.load(Ordering::Acquire),
            workers_added: self.workers_added.load(Ordering::Acquire),
            workers_dropped: self.workers_dropped.load(Ordering::Acquire),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_scheduled: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub windows_sent: u64,
    pub windows_compacted: u64,
    pub match_passes: u64,
    pub workers_added: u64,
    pub workers_dropped: u64,
}
