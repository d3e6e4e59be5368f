//! Live workers, their in-flight assignments, and dispatch.
//!
//! Lock order is pool → pending queue: dispatch and cancellation pop from the
//! queue while holding the pool lock, so a tasklet is always either queued or
//! assigned, never in between. Calls into [`WorkerHandle`]s happen after the
//! pool lock is released.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::config::{DispatchPolicy, SchedulerConfig};
use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;
use crate::pending::PendingQueue;
use crate::tasklet::{Tasklet, TaskletId};
use crate::worker::WorkerHandle;

/// What a cancellation request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The tasklet was still queued and has been removed.
    Dequeued,
    /// The tasklet is running on `worker`, which was signalled to abort it.
    Interrupted { worker: String },
    /// The tasklet is running on `worker` and interruption was not allowed.
    Running { worker: String },
    /// The abort signal could not be delivered to `worker`.
    SignalFailed { worker: String },
    /// Neither queued nor assigned: already resolved, or never issued.
    NotFound,
}

impl CancelOutcome {
    /// Whether cancellation was actually set in motion.
    pub fn initiated(&self) -> bool {
        matches!(self, Self::Dequeued | Self::Interrupted { .. })
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub in_flight: usize,
    pub capacity: usize,
}

struct WorkerEntry {
    handle: Arc<dyn WorkerHandle>,
    capacity: usize,
    /// Assigned tasklets in assignment order.
    assigned: IndexMap<TaskletId, Arc<Tasklet>>,
}

impl WorkerEntry {
    fn has_capacity(&self) -> bool {
        self.assigned.len() < self.capacity
    }
}

#[derive(Default)]
struct PoolState {
    workers: IndexMap<String, WorkerEntry>,
    /// Next worker index to try under round-robin.
    cursor: usize,
    terminated: bool,
}

type Launch = (Arc<dyn WorkerHandle>, Arc<Tasklet>);

impl PoolState {
    fn next_free_worker(&mut self, policy: DispatchPolicy) -> Option<usize> {
        let n = self.workers.len();
        match policy {
            DispatchPolicy::FirstFit => self.workers.values().position(WorkerEntry::has_capacity),
            DispatchPolicy::RoundRobin => {
                let start = self.cursor;
                let idx = (0..n)
                    .map(|step| (start + step) % n)
                    .find(|&idx| self.workers[idx].has_capacity())?;
                self.cursor = (idx + 1) % n;
                Some(idx)
            }
        }
    }

    /// Assign queued tasklets to free workers, FIFO from the queue head.
    fn plan(&mut self, pending: &PendingQueue, policy: DispatchPolicy) -> Vec<Launch> {
        let mut launches = Vec::new();
        if self.terminated {
            return launches;
        }
        while let Some(idx) = self.next_free_worker(policy) {
            let Some(tasklet) = pending.remove_next() else {
                break;
            };
            let entry = &mut self.workers[idx];
            entry.assigned.insert(tasklet.id(), Arc::clone(&tasklet));
            launches.push((Arc::clone(&entry.handle), tasklet));
        }
        launches
    }

    fn detach(&mut self, worker_id: &str) -> Option<WorkerEntry> {
        let idx = self.workers.get_index_of(worker_id)?;
        let (_, entry) = self.workers.shift_remove_index(idx)?;
        if self.cursor > idx {
            self.cursor -= 1;
        }
        if self.cursor >= self.workers.len() {
            self.cursor = 0;
        }
        Some(entry)
    }
}

pub struct WorkerPool {
    pending: Arc<PendingQueue>,
    state: Mutex<PoolState>,
    default_capacity: usize,
    policy: DispatchPolicy,
    metrics: Arc<RwLock<SchedulerMetrics>>,
}

impl WorkerPool {
    pub fn new(
        pending: Arc<PendingQueue>,
        config: &SchedulerConfig,
        metrics: Arc<RwLock<SchedulerMetrics>>,
    ) -> Self {
        Self {
            pending,
            state: Mutex::new(PoolState::default()),
            default_capacity: config.worker_capacity,
            policy: config.dispatch_policy,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a worker and dispatch queued work onto it.
    pub fn add_worker(&self, handle: Arc<dyn WorkerHandle>) -> Result<(), SchedulerError> {
        let id = handle.id().to_string();
        {
            let mut state = self.lock();
            if state.terminated {
                drop(state);
                handle.shutdown();
                return Err(SchedulerError::Terminated);
            }
            if state.workers.contains_key(&id) {
                return Err(SchedulerError::DuplicateWorker(id));
            }
            let capacity = handle.capacity().unwrap_or(self.default_capacity).max(1);
            info!(worker = %id, capacity, "worker added");
            state.workers.insert(id, WorkerEntry { handle, capacity, assigned: IndexMap::new() });
        }
        self.dispatch();
        Ok(())
    }

    /// Detach a worker, returning the tasklets it still held in assignment
    /// order, or `None` if it held none (or was unknown).
    pub fn remove_worker(&self, worker_id: &str) -> Option<Vec<Arc<Tasklet>>> {
        let entry = self.lock().detach(worker_id)?;
        let reclaimed: Vec<Arc<Tasklet>> = entry.assigned.into_values().collect();
        (!reclaimed.is_empty()).then_some(reclaimed)
    }

    /// Detach a lost worker and put its tasklets back at the queue head in
    /// one critical section. Returns the reclaimed ids, or `None` if the
    /// worker was not registered.
    pub fn reclaim_worker(&self, worker_id: &str) -> Option<Vec<TaskletId>> {
        let reclaimed: Vec<TaskletId> = {
            let mut state = self.lock();
            let entry = state.detach(worker_id)?;
            let tasklets: Vec<Arc<Tasklet>> = entry.assigned.into_values().collect();
            let ids = tasklets.iter().map(|t| t.id()).collect();
            self.pending.add_first_all(tasklets);
            ids
        };
        if !reclaimed.is_empty() {
            if let Ok(mut m) = self.metrics.write() {
                m.tasklets_reclaimed += reclaimed.len() as u64;
            }
        }
        self.dispatch();
        Some(reclaimed)
    }

    /// Mark tasklets finished on a worker, freeing its capacity.
    pub fn done_tasklets(&self, worker_id: &str, ids: &[TaskletId]) {
        {
            let mut state = self.lock();
            match state.workers.get_mut(worker_id) {
                Some(entry) => {
                    for id in ids {
                        if entry.assigned.shift_remove(id).is_none() {
                            debug!(
                                worker = %worker_id,
                                tasklet = %id,
                                "reported tasklet was not assigned"
                            );
                        }
                    }
                }
                None => {
                    // Late report from a lost worker: its reclaimed copies
                    // must not run again.
                    for id in ids {
                        if self.pending.remove(*id).is_some() {
                            debug!(
                                worker = %worker_id,
                                tasklet = %id,
                                "dropped reclaimed copy after late report"
                            );
                        }
                    }
                }
            }
        }
        self.dispatch();
    }

    /// Cancel a tasklet wherever it currently is.
    ///
    /// Queued tasklets are removed from the queue regardless of
    /// `may_interrupt`; assigned ones are only signalled when it is true.
    pub fn cancel_tasklet(&self, may_interrupt: bool, id: TaskletId) -> CancelOutcome {
        let holder = {
            let state = self.lock();
            let holder = state
                .workers
                .iter()
                .find(|(_, entry)| entry.assigned.contains_key(&id))
                .map(|(worker_id, entry)| (worker_id.clone(), Arc::clone(&entry.handle)));
            match holder {
                Some(holder) => holder,
                None if self.pending.remove(id).is_some() => return CancelOutcome::Dequeued,
                None => return CancelOutcome::NotFound,
            }
        };

        let (worker, handle) = holder;
        if !may_interrupt {
            return CancelOutcome::Running { worker };
        }
        match handle.cancel(id, may_interrupt) {
            Ok(()) => {
                debug!(worker = %worker, tasklet = %id, "cancellation signalled");
                CancelOutcome::Interrupted { worker }
            }
            Err(e) => {
                warn!(worker = %worker, tasklet = %id, error = %e, "failed to signal cancellation");
                CancelOutcome::SignalFailed { worker }
            }
        }
    }

    /// Assign queued tasklets to workers with free capacity and launch them.
    ///
    /// Returns the number of tasklets launched.
    pub fn dispatch(&self) -> usize {
        let mut launched = 0;
        loop {
            let launches = self.lock().plan(&self.pending, self.policy);
            if launches.is_empty() {
                break;
            }

            let mut lost: Vec<String> = Vec::new();
            // Tasklets of lost workers that never reached them.
            let mut unlaunched: Vec<Arc<Tasklet>> = Vec::new();
            for (handle, tasklet) in launches {
                let worker_id = handle.id().to_string();
                if lost.contains(&worker_id) {
                    unlaunched.push(tasklet);
                    continue;
                }
                match handle.launch(Arc::clone(&tasklet)) {
                    Ok(()) => {
                        debug!(worker = %worker_id, tasklet = %tasklet.id(), "tasklet launched");
                        launched += 1;
                    }
                    Err(e) => {
                        warn!(
                            worker = %worker_id,
                            tasklet = %tasklet.id(),
                            error = %e,
                            "launch failed, treating worker as lost"
                        );
                        lost.push(worker_id);
                        unlaunched.push(tasklet);
                    }
                }
            }

            if lost.is_empty() {
                break;
            }
            let mut state = self.lock();
            let mut reclaimed = 0;
            for worker_id in &lost {
                if let Some(entry) = state.detach(worker_id) {
                    let tasklets: Vec<Arc<Tasklet>> = entry.assigned.into_values().collect();
                    reclaimed += tasklets.len();
                    self.pending.add_first_all(tasklets);
                }
            }
            if state.terminated {
                // terminate() already took the workers; requeue what never
                // launched so the scheduler can cancel it.
                let queued = self.pending.ids();
                unlaunched.retain(|t| !queued.contains(&t.id()));
                debug!(stranded = unlaunched.len(), "launch failed during terminate");
                self.pending.add_first_all(unlaunched);
                break;
            }
            drop(state);
            if reclaimed > 0 {
                if let Ok(mut m) = self.metrics.write() {
                    m.tasklets_reclaimed += reclaimed as u64;
                }
            }
            // Retry on the remaining workers.
        }

        if launched > 0 {
            if let Ok(mut m) = self.metrics.write() {
                m.tasklets_dispatched += launched as u64;
            }
        }
        launched
    }

    /// Stop dispatching and release every worker.
    pub fn terminate(&self) {
        let workers = {
            let mut state = self.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            std::mem::take(&mut state.workers)
        };
        info!(workers = workers.len(), "worker pool terminated");
        for (_, entry) in workers {
            entry.handle.shutdown();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    /// Ids assigned to a worker, in assignment order.
    pub fn assigned(&self, worker_id: &str) -> Option<Vec<TaskletId>> {
        self.lock()
            .workers
            .get(worker_id)
            .map(|entry| entry.assigned.keys().copied().collect())
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.lock().workers.keys().cloned().collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        state.workers.values().fold(
            PoolStats { workers: state.workers.len(), ..Default::default() },
            |mut stats, entry| {
                stats.in_flight += entry.assigned.len();
                stats.capacity += entry.capacity;
                stats
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::tasklet::FnTasklet;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingWorker {
        id: String,
        capacity: Option<usize>,
        fail_launch: bool,
        launched: Mutex<Vec<TaskletId>>,
        cancelled: Mutex<Vec<TaskletId>>,
        shut_down: Mutex<bool>,
    }

    impl RecordingWorker {
        fn new(id: &str, capacity: usize) -> Arc<Self> {
            Arc::new(Self { id: id.to_string(), capacity: Some(capacity), ..Default::default() })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                capacity: Some(4),
                fail_launch: true,
                ..Default::default()
            })
        }

        fn launched(&self) -> Vec<TaskletId> {
            self.launched.lock().unwrap().clone()
        }
    }

    impl WorkerHandle for RecordingWorker {
        fn id(&self) -> &str {
            &self.id
        }
        fn capacity(&self) -> Option<usize> {
            self.capacity
        }
        fn launch(&self, tasklet: Arc<Tasklet>) -> Result<(), TransportError> {
            if self.fail_launch {
                return Err(TransportError::Unreachable(self.id.clone()));
            }
            self.launched.lock().unwrap().push(tasklet.id());
            Ok(())
        }
        fn cancel(&self, id: TaskletId, _may_interrupt: bool) -> Result<(), TransportError> {
            self.cancelled.lock().unwrap().push(id);
            Ok(())
        }
        fn shutdown(&self) {
            *self.shut_down.lock().unwrap() = true;
        }
    }

    fn tasklet(id: u64) -> Arc<Tasklet> {
        Arc::new(Tasklet::new(TaskletId(id), FnTasklet::new("noop", Ok), json!(id)))
    }

    fn ids(raw: &[u64]) -> Vec<TaskletId> {
        raw.iter().copied().map(TaskletId).collect()
    }

    fn pool_with(policy: DispatchPolicy) -> (WorkerPool, Arc<PendingQueue>) {
        let pending = Arc::new(PendingQueue::new());
        let config = SchedulerConfig { dispatch_policy: policy, ..Default::default() };
        let metrics = Arc::new(RwLock::new(SchedulerMetrics::default()));
        let pool = WorkerPool::new(Arc::clone(&pending), &config, metrics);
        (pool, pending)
    }

    #[test]
    fn add_worker_dispatches_up_to_capacity() {
        let (pool, pending) = pool_with(DispatchPolicy::FirstFit);
        for id in 1..=3 {
            pending.add_last(tasklet(id));
        }
        let w = RecordingWorker::new("w1", 2);
        pool.add_worker(w.clone()).unwrap();

        assert_eq!(w.launched(), ids(&[1, 2]));
        assert_eq!(pending.ids(), ids(&[3]));
        assert_eq!(pool.stats(), PoolStats { workers: 1, in_flight: 2, capacity: 2 });
    }

    #[test]
    fn done_frees_capacity_and_dispatches_next() {
        let (pool, pending) = pool_with(DispatchPolicy::FirstFit);
        let w = RecordingWorker::new("w1", 1);
        pool.add_worker(w.clone()).unwrap();
        pending.add_last(tasklet(1));
        pending.add_last(tasklet(2));
        pool.dispatch();
        assert_eq!(w.launched(), ids(&[1]));

        pool.done_tasklets("w1", &ids(&[1]));
        assert_eq!(w.launched(), ids(&[1, 2]));
        assert!(pending.is_empty());
    }

    #[test]
    fn preempted_tasklets_return_to_head_in_order() {
        let (pool, pending) = pool_with(DispatchPolicy::FirstFit);
        pending.add_last(tasklet(5));
        pending.add_last(tasklet(7));
        pool.add_worker(RecordingWorker::new("w1", 2)).unwrap();
        pending.add_last(tasklet(9));
        assert_eq!(pool.assigned("w1"), Some(ids(&[5, 7])));

        let reclaimed = pool.reclaim_worker("w1");
        assert_eq!(reclaimed, Some(ids(&[5, 7])));
        assert_eq!(pending.ids(), ids(&[5, 7, 9]));
        assert!(pool.assigned("w1").is_none());
        assert_eq!(pool.reclaim_worker("w1"), None);
    }

    #[test]
    fn remove_worker_reports_nothing_when_idle() {
        let (pool, _pending) = pool_with(DispatchPolicy::FirstFit);
        pool.add_worker(RecordingWorker::new("idle", 1)).unwrap();
        assert!(pool.remove_worker("idle").is_none());
        assert!(pool.remove_worker("unknown").is_none());
    }

    #[test]
    fn round_robin_spreads_work() {
        let (pool, pending) = pool_with(DispatchPolicy::RoundRobin);
        let a = RecordingWorker::new("a", 4);
        let b = RecordingWorker::new("b", 4);
        pool.add_worker(a.clone()).unwrap();
        pool.add_worker(b.clone()).unwrap();
        for id in 1..=4 {
            pending.add_last(tasklet(id));
        }
        pool.dispatch();

        assert_eq!(a.launched(), ids(&[1, 3]));
        assert_eq!(b.launched(), ids(&[2, 4]));
    }

    #[test]
    fn first_fit_fills_first_worker() {
        let (pool, pending) = pool_with(DispatchPolicy::FirstFit);
        let a = RecordingWorker::new("a", 2);
        let b = RecordingWorker::new("b", 2);
        pool.add_worker(a.clone()).unwrap();
        pool.add_worker(b.clone()).unwrap();
        for id in 1..=3 {
            pending.add_last(tasklet(id));
        }
        pool.dispatch();

        assert_eq!(a.launched(), ids(&[1, 2]));
        assert_eq!(b.launched(), ids(&[3]));
    }

    #[test]
    fn launch_failure_moves_work_to_surviving_worker() {
        let (pool, pending) = pool_with(DispatchPolicy::FirstFit);
        pool.add_worker(RecordingWorker::failing("broken")).unwrap();
        let good = RecordingWorker::new("good", 4);
        pool.add_worker(good.clone()).unwrap();

        pending.add_last(tasklet(1));
        pending.add_last(tasklet(2));
        pool.dispatch();

        assert_eq!(good.launched(), ids(&[1, 2]));
        assert_eq!(pool.worker_ids(), vec!["good".to_string()]);
    }

    #[test]
    fn cancel_queued_vs_running() {
        let (pool, pending) = pool_with(DispatchPolicy::FirstFit);
        let w = RecordingWorker::new("w1", 1);
        pool.add_worker(w.clone()).unwrap();
        pending.add_last(tasklet(1));
        pending.add_last(tasklet(2));
        pool.dispatch();

        assert_eq!(pool.cancel_tasklet(false, TaskletId(2)), CancelOutcome::Dequeued);
        assert!(pending.is_empty());

        assert_eq!(
            pool.cancel_tasklet(false, TaskletId(1)),
            CancelOutcome::Running { worker: "w1".into() }
        );
        assert!(w.cancelled.lock().unwrap().is_empty());

        assert_eq!(
            pool.cancel_tasklet(true, TaskletId(1)),
            CancelOutcome::Interrupted { worker: "w1".into() }
        );
        assert_eq!(*w.cancelled.lock().unwrap(), ids(&[1]));

        assert_eq!(pool.cancel_tasklet(true, TaskletId(42)), CancelOutcome::NotFound);
    }

    #[test]
    fn late_report_drops_reclaimed_copy() {
        let (pool, pending) = pool_with(DispatchPolicy::FirstFit);
        pending.add_last(tasklet(1));
        pool.add_worker(RecordingWorker::new("w1", 1)).unwrap();
        pool.reclaim_worker("w1");
        assert_eq!(pending.ids(), ids(&[1]));

        pool.done_tasklets("w1", &ids(&[1]));
        assert!(pending.is_empty());
    }

    #[test]
    fn terminate_releases_workers_and_stops_dispatch() {
        let (pool, pending) = pool_with(DispatchPolicy::FirstFit);
        let w = RecordingWorker::new("w1", 2);
        pool.add_worker(w.clone()).unwrap();
        pool.terminate();

        assert!(*w.shut_down.lock().unwrap());
        assert!(pool.is_terminated());

        pending.add_last(tasklet(1));
        assert_eq!(pool.dispatch(), 0);

        let late = RecordingWorker::new("late", 1);
        assert!(matches!(pool.add_worker(late.clone()), Err(SchedulerError::Terminated)));
        assert!(*late.shut_down.lock().unwrap());
    }

    /// Fails its launch after the pool was terminated underneath it.
    struct TerminatingWorker {
        pool: Mutex<Option<Arc<WorkerPool>>>,
    }

    impl WorkerHandle for TerminatingWorker {
        fn id(&self) -> &str {
            "terminating"
        }
        fn launch(&self, tasklet: Arc<Tasklet>) -> Result<(), TransportError> {
            if let Some(pool) = self.pool.lock().unwrap().take() {
                pool.terminate();
            }
            Err(TransportError::Unreachable(format!("gone before {}", tasklet.id())))
        }
        fn cancel(&self, _id: TaskletId, _may_interrupt: bool) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn launch_failure_during_terminate_requeues_work() {
        let (pool, pending) = pool_with(DispatchPolicy::FirstFit);
        let pool = Arc::new(pool);
        let worker = Arc::new(TerminatingWorker { pool: Mutex::new(Some(Arc::clone(&pool))) });
        pool.add_worker(worker).unwrap();

        pending.add_last(tasklet(1));
        pending.add_last(tasklet(2));
        assert_eq!(pool.dispatch(), 0);

        assert!(pool.is_terminated());
        assert_eq!(pool.stats().workers, 0);
        assert_eq!(pending.ids(), ids(&[1, 2]));
    }

    #[test]
    fn duplicate_worker_rejected() {
        let (pool, _pending) = pool_with(DispatchPolicy::FirstFit);
        pool.add_worker(RecordingWorker::new("w1", 1)).unwrap();
        let err = pool.add_worker(RecordingWorker::new("w1", 1)).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateWorker(id) if id == "w1"));
    }
}
