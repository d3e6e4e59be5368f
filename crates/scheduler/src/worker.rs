use std::sync::Arc;

use crate::error::TransportError;
use crate::tasklet::{Tasklet, TaskletId};

/// The scheduler's view of one remote worker.
///
/// Implementations sit on the transport boundary: they ship tasklets and
/// cancellation signals to the worker, and the worker's outcomes come back
/// through [`crate::Scheduler::worker_reported`]. The pool never holds its
/// lock while calling into a handle, so implementations may report back
/// synchronously.
pub trait WorkerHandle: Send + Sync {
    /// Identifier used in preemption and report events.
    fn id(&self) -> &str;

    /// Concurrent tasklets this worker accepts. `None` uses the configured default.
    fn capacity(&self) -> Option<usize> {
        None
    }

    /// Hand a tasklet to the worker. An error is treated as loss of the worker.
    fn launch(&self, tasklet: Arc<Tasklet>) -> Result<(), TransportError>;

    /// Ask the worker to abort a tasklet it holds.
    fn cancel(&self, id: TaskletId, may_interrupt: bool) -> Result<(), TransportError>;

    /// Release the worker. Called once on scheduler termination.
    fn shutdown(&self) {}
}
