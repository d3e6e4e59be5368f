use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Kind of terminal outcome delivered to a delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Completed,
    Failed,
    Cancelled,
}

/// Scheduler operational metrics.
///
/// Counters accumulate over the scheduler's lifetime; the gauges
/// (`pending_depth`, `live_workers`, `in_flight`, `worker_utilization`) are
/// filled in when a snapshot is taken.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    pub tasklets_enqueued: u64,
    pub tasklets_dispatched: u64,
    pub tasklets_completed: u64,
    pub tasklets_failed: u64,
    pub tasklets_cancelled: u64,
    /// Tasklets returned to the queue after their worker was lost.
    pub tasklets_reclaimed: u64,
    pub workers_allocated: u64,
    pub workers_preempted: u64,
    /// Duplicate resolutions and mixed-delegate records seen in reports.
    pub invariant_violations: u64,
    /// Reports received per worker id.
    pub reports_by_worker: HashMap<String, u64>,
    pub last_report: Option<DateTime<Utc>>,
    pub pending_depth: usize,
    pub live_workers: usize,
    pub in_flight: usize,
    /// Assigned tasklets over total worker capacity (0.0 - 1.0).
    pub worker_utilization: f64,
}

impl SchedulerMetrics {
    /// Record a worker report arriving.
    pub fn record_report(&mut self, worker_id: &str) {
        *self.reports_by_worker.entry(worker_id.to_string()).or_default() += 1;
        self.last_report = Some(Utc::now());
    }

    /// Record `count` tasklets reaching a terminal state.
    pub fn record_outcome(&mut self, kind: OutcomeKind, count: usize) {
        let count = count as u64;
        match kind {
            OutcomeKind::Completed => self.tasklets_completed += count,
            OutcomeKind::Failed => self.tasklets_failed += count,
            OutcomeKind::Cancelled => self.tasklets_cancelled += count,
        }
    }

    /// Tasklets resolved so far, whatever the outcome.
    pub fn tasklets_resolved(&self) -> u64 {
        self.tasklets_completed + self.tasklets_failed + self.tasklets_cancelled
    }
}
