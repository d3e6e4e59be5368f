//! Distributed tasklet scheduler.
//!
//! Applications submit [`Tasklet`]s and receive futures; the [`Scheduler`]
//! queues them, dispatches them to workers announced by resource
//! management, moves work off preempted workers, and resolves each future
//! exactly once from worker reports.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod future;
pub mod local;
pub mod metrics;
pub mod pending;
pub mod pool;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod tasklet;
pub mod worker;

pub use aggregate::{AggregateCallback, AggregateFuture, AggregateOutcome};
pub use config::{DispatchPolicy, SchedulerConfig};
pub use error::{SchedulerError, TaskletError, TransportError};
pub use future::{FutureCallback, TaskletDelegate, TaskletFuture, TaskletOutcome};
pub use local::LocalWorker;
pub use metrics::SchedulerMetrics;
pub use pool::{CancelOutcome, PoolStats};
pub use report::{TaskletReport, WorkerReport};
pub use scheduler::Scheduler;
pub use tasklet::{FnTasklet, Payload, Tasklet, TaskletFunction, TaskletId};
pub use worker::WorkerHandle;
