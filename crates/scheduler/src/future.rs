//! Per-tasklet result handles.
//!
//! A [`TaskletFuture`] is the delegate the scheduler resolves when a worker
//! reports. Callers either block on it, await it, or register a
//! [`FutureCallback`] that runs on the scheduler's callback pool.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::TaskletError;
use crate::pool::CancelOutcome;
use crate::tasklet::{Payload, TaskletId};

/// Terminal outcome of a single tasklet.
pub type TaskletOutcome = Result<Payload, TaskletError>;

/// User callback fired once per tasklet, on the callback pool.
pub trait FutureCallback: Send + Sync {
    fn on_success(&self, result: Payload);

    /// Remote failures and cancellations both arrive here.
    fn on_failure(&self, error: TaskletError);
}

/// Receiver of tasklet outcomes, keyed by id in the scheduler's registry.
///
/// The registry guarantees each id reaches its delegate at most once.
pub trait TaskletDelegate: Send + Sync {
    fn completed(&self, ids: &[TaskletId], result: Payload);
    fn threw_exception(&self, ids: &[TaskletId], error: String);
    fn cancelled(&self, id: TaskletId);
}

/// Back-reference used by futures to request cancellation.
pub(crate) trait TaskletCanceller: Send + Sync {
    fn cancel(&self, may_interrupt: bool, id: TaskletId) -> CancelOutcome;
}

/// Outcome cell shared between a delegate and the handles waiting on it.
pub(crate) struct OutcomeCell<T> {
    value: Mutex<T>,
    ready: Condvar,
    notify: Notify,
}

impl<T> OutcomeCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self { value: Mutex::new(value), ready: Condvar::new(), notify: Notify::new() }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake blocking and async waiters after the value changed.
    pub(crate) fn wake(&self) {
        self.ready.notify_all();
        self.notify.notify_waiters();
    }

    /// Block until `done` yields a value.
    pub(crate) fn wait<R>(&self, mut done: impl FnMut(&mut T) -> Option<R>) -> R {
        let mut guard = self.lock();
        loop {
            if let Some(r) = done(&mut *guard) {
                return r;
            }
            guard = self.ready.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`OutcomeCell::wait`], giving up with `None` once `timeout` elapses.
    pub(crate) fn wait_timeout<R>(
        &self,
        timeout: Duration,
        mut done: impl FnMut(&mut T) -> Option<R>,
    ) -> Option<R> {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if let Some(r) = done(&mut *guard) {
                return Some(r);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            guard = self
                .ready
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Async counterpart of [`OutcomeCell::wait`].
    pub(crate) async fn wait_async<R>(&self, mut done: impl FnMut(&mut T) -> Option<R>) -> R {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a wake between check and await is not lost.
            notified.as_mut().enable();
            let ready = {
                let mut guard = self.lock();
                done(&mut *guard)
            };
            if let Some(r) = ready {
                return r;
            }
            notified.await;
        }
    }
}

struct FutureInner {
    id: TaskletId,
    cell: OutcomeCell<Option<TaskletOutcome>>,
    callback: Option<Arc<dyn FutureCallback>>,
    callback_pool: Arc<rayon::ThreadPool>,
    canceller: Weak<dyn TaskletCanceller>,
}

impl FutureInner {
    fn resolve(&self, outcome: TaskletOutcome) {
        {
            let mut slot = self.cell.lock();
            if slot.is_some() {
                warn!(tasklet = %self.id, "ignoring second outcome for resolved tasklet");
                return;
            }
            *slot = Some(outcome.clone());
        }
        self.cell.wake();

        if let Some(callback) = &self.callback {
            let callback = Arc::clone(callback);
            self.callback_pool.spawn(move || match outcome {
                Ok(value) => callback.on_success(value),
                Err(error) => callback.on_failure(error),
            });
        }
    }
}

impl TaskletDelegate for FutureInner {
    fn completed(&self, _ids: &[TaskletId], result: Payload) {
        self.resolve(Ok(result));
    }

    fn threw_exception(&self, _ids: &[TaskletId], error: String) {
        self.resolve(Err(TaskletError::Remote(error)));
    }

    fn cancelled(&self, _id: TaskletId) {
        self.resolve(Err(TaskletError::Cancelled));
    }
}

/// Handle to the eventual outcome of one tasklet. Cheap to clone.
#[derive(Clone)]
pub struct TaskletFuture {
    inner: Arc<FutureInner>,
}

impl TaskletFuture {
    pub(crate) fn new(
        id: TaskletId,
        callback: Option<Arc<dyn FutureCallback>>,
        callback_pool: Arc<rayon::ThreadPool>,
        canceller: Weak<dyn TaskletCanceller>,
    ) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                id,
                cell: OutcomeCell::new(None),
                callback,
                callback_pool,
                canceller,
            }),
        }
    }

    /// The delegate registered for this future's id.
    pub(crate) fn delegate(&self) -> Arc<dyn TaskletDelegate> {
        self.inner.clone()
    }

    pub fn id(&self) -> TaskletId {
        self.inner.id
    }

    pub fn is_done(&self) -> bool {
        self.inner.cell.lock().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.inner.cell.lock(), Some(Err(TaskletError::Cancelled)))
    }

    /// Outcome if already resolved.
    pub fn try_get(&self) -> Option<TaskletOutcome> {
        self.inner.cell.lock().clone()
    }

    /// Block until the tasklet reaches a terminal state.
    pub fn get(&self) -> TaskletOutcome {
        self.inner.cell.wait(|slot| slot.clone())
    }

    /// Block for at most `timeout`. Elapsing does not affect the tasklet.
    pub fn get_timeout(&self, timeout: Duration) -> TaskletOutcome {
        self.inner
            .cell
            .wait_timeout(timeout, |slot| slot.clone())
            .unwrap_or(Err(TaskletError::WaitTimeout(timeout)))
    }

    /// Block and decode the result into `T`.
    pub fn get_as<T: DeserializeOwned>(&self) -> Result<T, TaskletError> {
        let value = self.get()?;
        serde_json::from_value(value).map_err(|e| TaskletError::Decode(e.to_string()))
    }

    /// Await the terminal state from async code.
    pub async fn wait(&self) -> TaskletOutcome {
        self.inner.cell.wait_async(|slot| slot.clone()).await
    }

    /// Request cancellation.
    ///
    /// Returns false without side effects if the tasklet already finished.
    /// Otherwise returns whether cancellation was initiated: the tasklet was
    /// still queued, or its worker was signalled. A signalled tasklet may
    /// still complete normally.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        if self.is_done() {
            return false;
        }
        match self.inner.canceller.upgrade() {
            Some(canceller) => canceller.cancel(may_interrupt, self.inner.id).initiated(),
            None => false,
        }
    }
}

impl std::fmt::Debug for TaskletFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskletFuture")
            .field("id", &self.inner.id)
            .field("done", &self.is_done())
            .finish()
    }
}
