//! In-process worker that runs tasklets on a tokio runtime.
//!
//! Tasklet functions are synchronous, so each one runs on the runtime's
//! blocking pool. Reports go straight back into the owning [`Scheduler`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::error::{SchedulerError, TransportError};
use crate::report::{TaskletReport, WorkerReport};
use crate::scheduler::Scheduler;
use crate::tasklet::{Tasklet, TaskletId};
use crate::worker::WorkerHandle;

type Running = Arc<Mutex<HashMap<TaskletId, AbortHandle>>>;

pub struct LocalWorker {
    id: String,
    capacity: Option<usize>,
    runtime: Handle,
    scheduler: Weak<Scheduler>,
    /// Tasklets started and not yet reported. Whoever removes an entry owns
    /// the report for it.
    running: Running,
}

impl LocalWorker {
    /// Create a worker on the runtime of the calling context.
    pub fn new(id: impl Into<String>, scheduler: &Arc<Scheduler>) -> Result<Self, SchedulerError> {
        Ok(Self::with_runtime(id, scheduler, Handle::try_current()?))
    }

    pub fn with_runtime(
        id: impl Into<String>,
        scheduler: &Arc<Scheduler>,
        runtime: Handle,
    ) -> Self {
        Self {
            id: id.into(),
            capacity: None,
            runtime,
            scheduler: Arc::downgrade(scheduler),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    fn running(&self) -> MutexGuard<'_, HashMap<TaskletId, AbortHandle>> {
        lock(&self.running)
    }

    /// Tasklets currently executing here.
    pub fn running_count(&self) -> usize {
        self.running().len()
    }

    /// Abort everything without reporting, as if the worker vanished.
    /// The scheduler learns of the loss through `worker_preempted`.
    pub fn kill(&self) {
        let aborted: Vec<AbortHandle> = self.running().drain().map(|(_, h)| h).collect();
        warn!(worker = %self.id, aborted = aborted.len(), "local worker killed");
        for handle in aborted {
            handle.abort();
        }
    }

    fn report_later(&self, report: TaskletReport) {
        let scheduler = self.scheduler.clone();
        let worker_id = self.id.clone();
        self.runtime.spawn(async move {
            deliver(&scheduler, &worker_id, report);
        });
    }
}

fn lock(running: &Running) -> MutexGuard<'_, HashMap<TaskletId, AbortHandle>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

fn deliver(scheduler: &Weak<Scheduler>, worker_id: &str, report: TaskletReport) {
    let Some(scheduler) = scheduler.upgrade() else {
        debug!(worker = %worker_id, "scheduler dropped, discarding report");
        return;
    };
    if let Err(e) = scheduler.worker_reported(worker_id, WorkerReport::single(report)) {
        error!(worker = %worker_id, error = %e, "report rejected");
    }
}

impl WorkerHandle for LocalWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn launch(&self, tasklet: Arc<Tasklet>) -> Result<(), TransportError> {
        let id = tasklet.id();
        let running = Arc::clone(&self.running);
        let scheduler = self.scheduler.clone();
        let worker_id = self.id.clone();

        // Held across spawn and insert so the task cannot finish unregistered.
        let mut guard = self.running();
        let task = self.runtime.spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || tasklet.run()).await;
            if lock(&running).remove(&id).is_none() {
                // Cancelled or killed while running.
                return;
            }
            let report = match outcome {
                Ok(Ok(value)) => TaskletReport::result(vec![id], value),
                Ok(Err(message)) => TaskletReport::failure(vec![id], message),
                Err(join) => TaskletReport::failure(vec![id], format!("tasklet panicked: {join}")),
            };
            deliver(&scheduler, &worker_id, report);
        });
        guard.insert(id, task.abort_handle());
        debug!(worker = %self.id, tasklet = %id, "tasklet started");
        Ok(())
    }

    fn cancel(&self, id: TaskletId, may_interrupt: bool) -> Result<(), TransportError> {
        if !may_interrupt {
            return Ok(());
        }
        let Some(handle) = self.running().remove(&id) else {
            // Already finished; its report is on the way.
            return Ok(());
        };
        handle.abort();
        self.report_later(TaskletReport::cancelled(id));
        Ok(())
    }

    /// Running tasklets are left to finish; their reports still resolve.
    fn shutdown(&self) {
        debug!(worker = %self.id, running = self.running_count(), "local worker shut down");
    }
}

impl std::fmt::Debug for LocalWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorker")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("running", &self.running_count())
            .finish()
    }
}
