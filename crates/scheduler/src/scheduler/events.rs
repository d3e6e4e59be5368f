use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::SchedulerError;
use crate::future::TaskletDelegate;
use crate::metrics::OutcomeKind;
use crate::report::{TaskletReport, WorkerReport};
use crate::tasklet::TaskletId;
use crate::worker::WorkerHandle;

use super::Scheduler;

impl Scheduler {
    /// A worker became available. Queued tasklets are dispatched to it.
    pub fn worker_allocated(&self, worker: Arc<dyn WorkerHandle>) -> Result<(), SchedulerError> {
        let id = worker.id().to_string();
        self.pool.add_worker(worker)?;
        if let Ok(mut m) = self.metrics.write() {
            m.workers_allocated += 1;
        }
        info!(worker = %id, "worker allocated");
        self.cancel_stranded();
        Ok(())
    }

    /// A worker was lost. Its tasklets go back to the head of the queue, in
    /// their original order, ahead of work that was never dispatched.
    ///
    /// Returns the reclaimed ids; an unknown worker reclaims nothing.
    pub fn worker_preempted(&self, worker_id: &str) -> Vec<TaskletId> {
        let Some(reclaimed) = self.pool.reclaim_worker(worker_id) else {
            debug!(worker = %worker_id, "preemption for unknown worker ignored");
            return Vec::new();
        };
        if let Ok(mut m) = self.metrics.write() {
            m.workers_preempted += 1;
        }
        info!(worker = %worker_id, reclaimed = reclaimed.len(), "worker preempted");
        self.cancel_stranded();
        reclaimed
    }

    /// Apply a worker's ordered batch of outcome records.
    ///
    /// Each record first frees the worker's capacity, then removes its ids
    /// from the registry and delivers the outcome. Every id is resolved on
    /// its own, so one bad id never blocks the others; bookkeeping
    /// violations are logged and the first one is returned once the whole
    /// batch has been applied.
    pub fn worker_reported(
        &self,
        worker_id: &str,
        report: WorkerReport,
    ) -> Result<(), SchedulerError> {
        if let Ok(mut m) = self.metrics.write() {
            m.record_report(worker_id);
        }
        debug!(worker = %worker_id, records = report.reports.len(), "worker report received");

        let mut violations = Vec::new();
        for record in report.reports {
            match record {
                TaskletReport::Result { ids, value } => {
                    self.pool.done_tasklets(worker_id, &ids);
                    let n = self.resolve(worker_id, &ids, &mut violations, |delegate, group| {
                        delegate.completed(group, value.clone())
                    });
                    self.record_outcome(OutcomeKind::Completed, n);
                }
                TaskletReport::Cancelled { id } => {
                    self.pool.done_tasklets(worker_id, &[id]);
                    let n = self.resolve(worker_id, &[id], &mut violations, |delegate, _| {
                        delegate.cancelled(id)
                    });
                    self.record_outcome(OutcomeKind::Cancelled, n);
                }
                TaskletReport::Failure { ids, error } => {
                    self.pool.done_tasklets(worker_id, &ids);
                    let n = self.resolve(worker_id, &ids, &mut violations, |delegate, group| {
                        delegate.threw_exception(group, error.clone())
                    });
                    self.record_outcome(OutcomeKind::Failed, n);
                }
            }
        }

        self.cancel_stranded();
        if !violations.is_empty() {
            if let Ok(mut m) = self.metrics.write() {
                m.invariant_violations += violations.len() as u64;
            }
        }
        match violations.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    /// Remove `ids` from the registry and hand each delegate its share.
    /// Returns how many ids were delivered.
    fn resolve<F>(
        &self,
        worker_id: &str,
        ids: &[TaskletId],
        violations: &mut Vec<SchedulerError>,
        mut deliver: F,
    ) -> usize
    where
        F: FnMut(&dyn TaskletDelegate, &[TaskletId]),
    {
        let resolution = self.registry.take(ids);

        for id in &resolution.missing {
            error!(worker = %worker_id, tasklet = %id, "tasklet resolved more than once");
            violations.push(SchedulerError::DuplicateResolution(*id));
        }
        if resolution.groups.len() > 1 {
            error!(
                worker = %worker_id,
                ?ids,
                delegates = resolution.groups.len(),
                "batched report spans several delegates"
            );
            violations.push(SchedulerError::MixedDelegates {
                ids: ids.to_vec(),
                delegates: resolution.groups.len(),
            });
        }

        let mut delivered = 0;
        for (delegate, group) in resolution.groups {
            deliver(delegate.as_ref(), &group);
            delivered += group.len();
        }
        delivered
    }
}
