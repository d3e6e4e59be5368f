use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::{debug, error, info, warn};

use crate::aggregate::{AggregateCallback, AggregateFuture};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::future::{FutureCallback, TaskletCanceller, TaskletFuture};
use crate::metrics::{OutcomeKind, SchedulerMetrics};
use crate::pending::PendingQueue;
use crate::pool::{CancelOutcome, WorkerPool};
use crate::registry::DelegateRegistry;
use crate::tasklet::{Payload, Tasklet, TaskletFunction, TaskletId};

/// The tasklet scheduler. Owns the id → delegate registry and composes the
/// pending queue and worker pool.
///
/// Registry, queue and pool each guard their own state; no lock spans all
/// three, and callbacks never run under any of them.
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) next_id: AtomicU64,
    pub(super) registry: DelegateRegistry,
    pub(super) pending: Arc<PendingQueue>,
    pub(super) pool: WorkerPool,
    /// Bounded pool that runs user callbacks off the report path.
    pub(super) callbacks: Arc<rayon::ThreadPool>,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    pub(super) terminated: AtomicBool,
    /// Handed to futures so they can request cancellation.
    pub(super) this: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler with the given config.
    pub fn new(config: SchedulerConfig) -> Result<Arc<Self>, SchedulerError> {
        config.validate()?;
        let callbacks = rayon::ThreadPoolBuilder::new()
            .num_threads(config.callback_threads)
            .thread_name(|i| format!("swarm-callback-{i}"))
            .panic_handler(log_callback_panic)
            .build()?;
        let pending = Arc::new(PendingQueue::new());
        let metrics = Arc::new(RwLock::new(SchedulerMetrics::default()));
        let pool = WorkerPool::new(Arc::clone(&pending), &config, Arc::clone(&metrics));

        info!(
            callback_threads = config.callback_threads,
            worker_capacity = config.worker_capacity,
            policy = ?config.dispatch_policy,
            "scheduler created"
        );

        Ok(Arc::new_cyclic(|this| Self {
            config,
            next_id: AtomicU64::new(0),
            registry: DelegateRegistry::new(),
            pending,
            pool,
            callbacks: Arc::new(callbacks),
            metrics,
            terminated: AtomicBool::new(false),
            this: this.clone(),
        }))
    }

    fn canceller(&self) -> Weak<dyn TaskletCanceller> {
        self.this.clone()
    }

    fn allocate_id(&self) -> TaskletId {
        TaskletId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Submit a tasklet. The returned future resolves exactly once.
    pub fn enqueue(
        &self,
        function: Arc<dyn TaskletFunction>,
        input: Payload,
        callback: Option<Arc<dyn FutureCallback>>,
    ) -> Result<TaskletFuture, SchedulerError> {
        if self.is_terminated() {
            return Err(SchedulerError::Terminated);
        }
        let id = self.allocate_id();
        let future =
            TaskletFuture::new(id, callback, Arc::clone(&self.callbacks), self.canceller());
        // Registered before the tasklet becomes visible to dispatch or reports.
        if let Err(taken) = self.registry.register(id, future.delegate()) {
            error!(tasklet = %taken, "tasklet id already registered");
            return Err(SchedulerError::DuplicateTasklet(taken));
        }

        debug!(tasklet = %id, function = function.name(), "tasklet enqueued");
        self.submit(vec![Arc::new(Tasklet::new(id, function, input))]);
        Ok(future)
    }

    /// Submit one tasklet per input, all resolving into a single aggregate.
    pub fn enqueue_aggregate(
        &self,
        function: Arc<dyn TaskletFunction>,
        inputs: Vec<Payload>,
        callback: Option<Arc<dyn AggregateCallback>>,
    ) -> Result<AggregateFuture, SchedulerError> {
        if self.is_terminated() {
            return Err(SchedulerError::Terminated);
        }
        let ids: Vec<TaskletId> = inputs.iter().map(|_| self.allocate_id()).collect();
        let future = AggregateFuture::new(
            ids.clone(),
            callback,
            Arc::clone(&self.callbacks),
            self.canceller(),
        );
        if let Err(taken) = self.registry.register_all(&ids, future.delegate()) {
            error!(tasklet = %taken, "tasklet id already registered");
            return Err(SchedulerError::DuplicateTasklet(taken));
        }

        debug!(tasklets = ids.len(), function = function.name(), "aggregate enqueued");
        let tasklets = ids
            .into_iter()
            .zip(inputs)
            .map(|(id, input)| Arc::new(Tasklet::new(id, Arc::clone(&function), input)))
            .collect();
        self.submit(tasklets);
        Ok(future)
    }

    fn submit(&self, tasklets: Vec<Arc<Tasklet>>) {
        if let Ok(mut m) = self.metrics.write() {
            m.tasklets_enqueued += tasklets.len() as u64;
        }
        for tasklet in tasklets {
            self.pending.add_last(tasklet);
        }
        self.pool.dispatch();
        self.cancel_stranded();
    }

    /// After termination nothing dispatches the queue again. Tasklets that
    /// reach it late (a submit racing `terminate`, or work handed back by a
    /// launch that failed mid-shutdown) are resolved as cancelled here.
    pub(super) fn cancel_stranded(&self) {
        if !self.is_terminated() {
            return;
        }
        for tasklet in self.pending.drain() {
            debug!(tasklet = %tasklet.id(), "cancelling tasklet queued after terminate");
            self.resolve_cancelled(tasklet.id());
        }
    }

    /// Cancel a tasklet.
    ///
    /// A tasklet still waiting in the queue is removed and resolved as
    /// cancelled. A running one is signalled only when `may_interrupt` is
    /// set; its worker then reports the cancellation (or a result, if it
    /// finished first). Cancelling a resolved tasklet does nothing.
    pub fn cancel_tasklet(&self, may_interrupt: bool, id: TaskletId) -> CancelOutcome {
        let outcome = self.pool.cancel_tasklet(may_interrupt, id);
        if outcome == CancelOutcome::Dequeued {
            self.resolve_cancelled(id);
        }
        debug!(tasklet = %id, may_interrupt, ?outcome, "cancel requested");
        outcome
    }

    pub(super) fn resolve_cancelled(&self, id: TaskletId) {
        match self.registry.remove(id) {
            Some(delegate) => {
                delegate.cancelled(id);
                self.record_outcome(OutcomeKind::Cancelled, 1);
            }
            None => warn!(tasklet = %id, "cancelled tasklet had no registered delegate"),
        }
    }

    pub(super) fn record_outcome(&self, kind: OutcomeKind, count: usize) {
        if let Ok(mut m) = self.metrics.write() {
            m.record_outcome(kind, count);
        }
    }

    /// Stop dispatching and release all workers.
    ///
    /// Tasklets that never left the queue are resolved as cancelled.
    /// In-flight tasklets stay registered, so reports that still arrive are
    /// delivered normally.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.terminate();
        let drained = self.pending.drain();
        let in_flight = self.registry.len().saturating_sub(drained.len());
        info!(cancelled = drained.len(), in_flight, "scheduler terminated");
        for tasklet in drained {
            self.resolve_cancelled(tasklet.id());
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Tasklets waiting for a worker.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Tasklets submitted but not yet resolved.
    pub fn unresolved_count(&self) -> usize {
        self.registry.len()
    }

    pub fn worker_count(&self) -> usize {
        self.pool.stats().workers
    }

    /// Ids currently assigned to a worker, in assignment order.
    pub fn assigned_to(&self, worker_id: &str) -> Option<Vec<TaskletId>> {
        self.pool.assigned(worker_id)
    }

    /// Ids waiting in the pending queue, head first.
    pub fn pending_ids(&self) -> Vec<TaskletId> {
        self.pending.ids()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        let stats = self.pool.stats();
        let mut snapshot = self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone();
        snapshot.pending_depth = self.pending.len();
        snapshot.live_workers = stats.workers;
        snapshot.in_flight = stats.in_flight;
        snapshot.worker_utilization = if stats.capacity == 0 {
            0.0
        } else {
            stats.in_flight as f64 / stats.capacity as f64
        };
        snapshot
    }
}

/// A panicking application callback is logged and the callback thread keeps serving.
fn log_callback_panic(panic: Box<dyn Any + Send>) {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    error!(panic = %message, "tasklet callback panicked");
}

impl TaskletCanceller for Scheduler {
    fn cancel(&self, may_interrupt: bool, id: TaskletId) -> CancelOutcome {
        self.cancel_tasklet(may_interrupt, id)
    }
}
