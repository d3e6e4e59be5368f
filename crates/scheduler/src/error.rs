use std::time::Duration;

use thiserror::Error;

use crate::tasklet::TaskletId;

/// Scheduler-level faults.
///
/// Variants for which [`SchedulerError::is_fatal`] returns true indicate
/// broken bookkeeping upstream (a worker or transport violating the report
/// protocol) and are not locally recoverable.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("tasklet {0} resolved more than once")]
    DuplicateResolution(TaskletId),

    #[error("report for tasklets {ids:?} spans {delegates} different delegates")]
    MixedDelegates { ids: Vec<TaskletId>, delegates: usize },

    #[error("unknown tasklet report: {0}")]
    UnknownReport(String),

    #[error("malformed worker report: {0}")]
    MalformedReport(String),

    #[error("tasklet {0} is already registered")]
    DuplicateTasklet(TaskletId),

    #[error("scheduler has been terminated")]
    Terminated,

    #[error("worker {0} is already registered")]
    DuplicateWorker(String),

    #[error("config error: {0}")]
    Config(#[from] swarm_core::CoreError),

    #[error("failed to start callback pool: {0}")]
    CallbackPool(#[from] rayon::ThreadPoolBuildError),

    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

impl SchedulerError {
    /// Whether the error is a protocol/bookkeeping invariant violation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateResolution(_)
                | Self::MixedDelegates { .. }
                | Self::UnknownReport(_)
                | Self::DuplicateTasklet(_)
        )
    }
}

/// Outcome errors delivered to the caller of a tasklet.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskletError {
    #[error("tasklet failed remotely: {0}")]
    Remote(String),

    #[error("tasklet was cancelled")]
    Cancelled,

    #[error("could not decode tasklet result: {0}")]
    Decode(String),

    #[error("timed out after {0:?} waiting for tasklet result")]
    WaitTimeout(Duration),
}

/// Errors raised by a [`crate::worker::WorkerHandle`] across the transport boundary.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("worker {0} is unreachable")]
    Unreachable(String),

    #[error("transport error: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(SchedulerError::DuplicateResolution(TaskletId(1)).is_fatal());
        let mixed =
            SchedulerError::MixedDelegates { ids: vec![TaskletId(1), TaskletId(2)], delegates: 2 };
        assert!(mixed.is_fatal());
        assert!(SchedulerError::UnknownReport("bogus".into()).is_fatal());
        assert!(SchedulerError::DuplicateTasklet(TaskletId(3)).is_fatal());
        assert!(!SchedulerError::MalformedReport("eof".into()).is_fatal());
        assert!(!SchedulerError::Terminated.is_fatal());
        assert!(!SchedulerError::DuplicateWorker("w".into()).is_fatal());
    }

    #[test]
    fn messages() {
        assert_eq!(
            SchedulerError::DuplicateResolution(TaskletId(7)).to_string(),
            "tasklet 7 resolved more than once"
        );
        assert_eq!(
            TaskletError::Remote("boom".into()).to_string(),
            "tasklet failed remotely: boom"
        );
    }
}
