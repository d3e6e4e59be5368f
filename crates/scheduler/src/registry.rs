//! Tasklet id → delegate registry.
//!
//! Every registered id maps to exactly one unresolved delegate and is
//! removed exactly once, at the moment its outcome is delivered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::future::TaskletDelegate;
use crate::tasklet::TaskletId;

/// Result of removing a batch of ids.
#[derive(Default)]
pub struct Resolution {
    /// Removed ids grouped by delegate, in first-seen order.
    pub groups: Vec<(Arc<dyn TaskletDelegate>, Vec<TaskletId>)>,
    /// Ids that were not registered (already resolved, or never issued).
    pub missing: Vec<TaskletId>,
}

#[derive(Default)]
pub struct DelegateRegistry {
    delegates: Mutex<HashMap<TaskletId, Arc<dyn TaskletDelegate>>>,
}

fn same_delegate(a: &Arc<dyn TaskletDelegate>, b: &Arc<dyn TaskletDelegate>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskletId, Arc<dyn TaskletDelegate>>> {
        self.delegates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register all `ids` against one delegate in a single critical section.
    ///
    /// Registers nothing and returns the first colliding id if any id is
    /// already present.
    pub fn register_all(
        &self,
        ids: &[TaskletId],
        delegate: Arc<dyn TaskletDelegate>,
    ) -> Result<(), TaskletId> {
        let mut map = self.lock();
        if let Some(taken) = ids.iter().find(|id| map.contains_key(id)) {
            return Err(*taken);
        }
        for id in ids {
            map.insert(*id, Arc::clone(&delegate));
        }
        Ok(())
    }

    pub fn register(
        &self,
        id: TaskletId,
        delegate: Arc<dyn TaskletDelegate>,
    ) -> Result<(), TaskletId> {
        self.register_all(&[id], delegate)
    }

    /// Remove a single id.
    pub fn remove(&self, id: TaskletId) -> Option<Arc<dyn TaskletDelegate>> {
        self.lock().remove(&id)
    }

    /// Remove every id of a batch atomically and group them by delegate.
    pub fn take(&self, ids: &[TaskletId]) -> Resolution {
        let mut resolution = Resolution::default();
        let mut map = self.lock();
        for id in ids {
            match map.remove(id) {
                Some(delegate) => {
                    match resolution.groups.iter_mut().find(|(d, _)| same_delegate(d, &delegate)) {
                        Some((_, group)) => group.push(*id),
                        None => resolution.groups.push((delegate, vec![*id])),
                    }
                }
                None => resolution.missing.push(*id),
            }
        }
        resolution
    }

    pub fn contains(&self, id: TaskletId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
