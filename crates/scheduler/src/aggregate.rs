//! One delegate shared by a group of tasklets submitted together.
//!
//! Workers may fold several member tasklets into a single `Result` record;
//! each record becomes one [`AggregateOutcome`]. The aggregate is finished
//! once every member id has been resolved.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::TaskletError;
use crate::future::{OutcomeCell, TaskletCanceller, TaskletDelegate, TaskletOutcome};
use crate::tasklet::{Payload, TaskletId};

/// Outcome covering one or more member tasklets.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutcome {
    pub ids: Vec<TaskletId>,
    pub outcome: TaskletOutcome,
}

/// Callback fired on the callback pool for every aggregate outcome.
pub trait AggregateCallback: Send + Sync {
    fn on_outcome(&self, outcome: AggregateOutcome);
}

#[derive(Default)]
struct AggregateState {
    remaining: HashSet<TaskletId>,
    /// Outcomes not yet handed out by `next`.
    unread: VecDeque<AggregateOutcome>,
}

struct AggregateInner {
    ids: Vec<TaskletId>,
    cell: OutcomeCell<AggregateState>,
    callback: Option<Arc<dyn AggregateCallback>>,
    callback_pool: Arc<rayon::ThreadPool>,
    canceller: Weak<dyn TaskletCanceller>,
}

impl AggregateInner {
    fn record(&self, ids: &[TaskletId], outcome: TaskletOutcome) {
        let accepted = {
            let mut state = self.cell.lock();
            let accepted: Vec<TaskletId> =
                ids.iter().copied().filter(|id| state.remaining.remove(id)).collect();
            if accepted.len() != ids.len() {
                warn!(?ids, "aggregate received outcome for unknown or resolved members");
            }
            if accepted.is_empty() {
                return;
            }
            let entry = AggregateOutcome { ids: accepted, outcome };
            state.unread.push_back(entry.clone());
            debug!(remaining = state.remaining.len(), "aggregate outcome recorded");
            entry
        };
        self.cell.wake();

        if let Some(callback) = &self.callback {
            let callback = Arc::clone(callback);
            self.callback_pool.spawn(move || callback.on_outcome(accepted));
        }
    }
}

impl TaskletDelegate for AggregateInner {
    fn completed(&self, ids: &[TaskletId], result: Payload) {
        self.record(ids, Ok(result));
    }

    fn threw_exception(&self, ids: &[TaskletId], error: String) {
        self.record(ids, Err(TaskletError::Remote(error)));
    }

    fn cancelled(&self, id: TaskletId) {
        self.record(&[id], Err(TaskletError::Cancelled));
    }
}

/// Handle to a group of tasklets sharing one delegate. Cheap to clone.
#[derive(Clone)]
pub struct AggregateFuture {
    inner: Arc<AggregateInner>,
}

impl AggregateFuture {
    pub(crate) fn new(
        ids: Vec<TaskletId>,
        callback: Option<Arc<dyn AggregateCallback>>,
        callback_pool: Arc<rayon::ThreadPool>,
        canceller: Weak<dyn TaskletCanceller>,
    ) -> Self {
        let state =
            AggregateState { remaining: ids.iter().copied().collect(), unread: VecDeque::new() };
        Self {
            inner: Arc::new(AggregateInner {
                ids,
                cell: OutcomeCell::new(state),
                callback,
                callback_pool,
                canceller,
            }),
        }
    }

    pub(crate) fn delegate(&self) -> Arc<dyn TaskletDelegate> {
        self.inner.clone()
    }

    /// Member ids in submission order.
    pub fn ids(&self) -> &[TaskletId] {
        &self.inner.ids
    }

    /// True once every member has been resolved.
    pub fn is_done(&self) -> bool {
        self.inner.cell.lock().remaining.is_empty()
    }

    /// Block for the next unread outcome; `None` once all members are resolved
    /// and every outcome has been read.
    pub fn next(&self) -> Option<AggregateOutcome> {
        self.inner.cell.wait(|state| match state.unread.pop_front() {
            Some(outcome) => Some(Some(outcome)),
            None if state.remaining.is_empty() => Some(None),
            None => None,
        })
    }

    /// Like [`AggregateFuture::next`] but gives up after `timeout`.
    pub fn next_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<AggregateOutcome>, TaskletError> {
        self.inner
            .cell
            .wait_timeout(timeout, |state| match state.unread.pop_front() {
                Some(outcome) => Some(Some(outcome)),
                None if state.remaining.is_empty() => Some(None),
                None => None,
            })
            .ok_or(TaskletError::WaitTimeout(timeout))
    }

    /// Block until every member is resolved and return the unread outcomes.
    pub fn collect(&self) -> Vec<AggregateOutcome> {
        self.inner.cell.wait(|state| {
            state.remaining.is_empty().then(|| state.unread.drain(..).collect())
        })
    }

    /// Async variant of [`AggregateFuture::collect`].
    pub async fn wait_all(&self) -> Vec<AggregateOutcome> {
        self.inner
            .cell
            .wait_async(|state| {
                state.remaining.is_empty().then(|| state.unread.drain(..).collect())
            })
            .await
    }

    /// Request cancellation of every unresolved member.
    ///
    /// Returns how many members had cancellation initiated.
    pub fn cancel(&self, may_interrupt: bool) -> usize {
        let remaining: Vec<TaskletId> = {
            let state = self.inner.cell.lock();
            self.inner.ids.iter().copied().filter(|id| state.remaining.contains(id)).collect()
        };
        let Some(canceller) = self.inner.canceller.upgrade() else {
            return 0;
        };
        remaining
            .into_iter()
            .filter(|id| canceller.cancel(may_interrupt, *id).initiated())
            .count()
    }
}

impl std::fmt::Debug for AggregateFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateFuture")
            .field("ids", &self.inner.ids)
            .field("done", &self.is_done())
            .finish()
    }
}
