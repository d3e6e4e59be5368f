use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// In-memory form of a serializable tasklet input or result.
pub type Payload = serde_json::Value;

/// Scheduler-assigned tasklet identifier. Unique for the scheduler's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskletId(pub u64);

impl fmt::Display for TaskletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TaskletId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A computation shipped to a worker.
///
/// The scheduler never calls [`TaskletFunction::call`] itself; it only
/// carries the function to whichever worker runs it.
pub trait TaskletFunction: Send + Sync {
    /// Name used for logging and by transports that look functions up remotely.
    fn name(&self) -> &str;

    /// Run the computation. The error string becomes the remote failure message.
    fn call(&self, input: Payload) -> Result<Payload, String>;
}

/// Adapter turning a closure into a [`TaskletFunction`].
pub struct FnTasklet<F> {
    name: String,
    f: F,
}

impl<F> FnTasklet<F>
where
    F: Fn(Payload) -> Result<Payload, String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Arc<Self> {
        Arc::new(Self { name: name.into(), f })
    }
}

impl<F> TaskletFunction for FnTasklet<F>
where
    F: Fn(Payload) -> Result<Payload, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, input: Payload) -> Result<Payload, String> {
        (self.f)(input)
    }
}

/// A unit of remote computation. Immutable once created.
#[derive(Clone)]
pub struct Tasklet {
    id: TaskletId,
    function: Arc<dyn TaskletFunction>,
    input: Payload,
}

impl Tasklet {
    pub(crate) fn new(id: TaskletId, function: Arc<dyn TaskletFunction>, input: Payload) -> Self {
        Self { id, function, input }
    }

    pub fn id(&self) -> TaskletId {
        self.id
    }

    pub fn function(&self) -> &Arc<dyn TaskletFunction> {
        &self.function
    }

    pub fn input(&self) -> &Payload {
        &self.input
    }

    /// Execute the tasklet in-process. Used by workers, never by the scheduler.
    pub fn run(&self) -> Result<Payload, String> {
        self.function.call(self.input.clone())
    }
}

impl fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tasklet")
            .field("id", &self.id)
            .field("function", &self.function.name())
            .field("input", &self.input)
            .finish()
    }
}
