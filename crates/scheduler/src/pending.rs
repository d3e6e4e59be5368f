//! Double-ended staging queue for tasklets that have not been dispatched.
//!
//! New submissions go to the tail; tasklets reclaimed from a lost worker go
//! to the head so they run before fresh work.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::tasklet::{Tasklet, TaskletId};

#[derive(Debug, Default)]
pub struct PendingQueue {
    tasklets: Mutex<VecDeque<Arc<Tasklet>>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<Tasklet>>> {
        self.tasklets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Normal submission path.
    pub fn add_last(&self, tasklet: Arc<Tasklet>) {
        self.lock().push_back(tasklet);
    }

    /// Reinsert a single reclaimed tasklet ahead of everything queued.
    pub fn add_first(&self, tasklet: Arc<Tasklet>) {
        self.lock().push_front(tasklet);
    }

    /// Reinsert reclaimed tasklets at the head, keeping their relative order.
    pub fn add_first_all(&self, tasklets: Vec<Arc<Tasklet>>) {
        let mut queue = self.lock();
        for tasklet in tasklets.into_iter().rev() {
            queue.push_front(tasklet);
        }
    }

    /// Take the head of the queue.
    pub fn remove_next(&self) -> Option<Arc<Tasklet>> {
        self.lock().pop_front()
    }

    /// Remove a specific tasklet that has not been dispatched yet.
    pub fn remove(&self, id: TaskletId) -> Option<Arc<Tasklet>> {
        let mut queue = self.lock();
        let pos = queue.iter().position(|t| t.id() == id)?;
        queue.remove(pos)
    }

    /// Empty the queue, returning its contents in queue order.
    pub fn drain(&self) -> Vec<Arc<Tasklet>> {
        self.lock().drain(..).collect()
    }

    /// Ids in queue order (head first).
    pub fn ids(&self) -> Vec<TaskletId> {
        self.lock().iter().map(|t| t.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
