//! Outcome records sent back by workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchedulerError;
use crate::tasklet::{Payload, TaskletId};

/// One outcome record. The set of variants is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskletReport {
    /// One value covering every listed tasklet.
    Result { ids: Vec<TaskletId>, value: Payload },
    /// The worker aborted the tasklet after a cancellation signal.
    Cancelled { id: TaskletId },
    /// Execution failed for every listed tasklet.
    Failure { ids: Vec<TaskletId>, error: String },
}

impl TaskletReport {
    /// Tags of the closed record set.
    pub const TAGS: [&'static str; 3] = ["result", "cancelled", "failure"];

    /// Decode one record, telling an unknown tag apart from a broken record.
    fn from_value(raw: Value) -> Result<Self, SchedulerError> {
        if let Some(tag) = raw.get("type").and_then(Value::as_str) {
            if !Self::TAGS.contains(&tag) {
                return Err(SchedulerError::UnknownReport(tag.to_string()));
            }
        }
        serde_json::from_value(raw).map_err(|e| SchedulerError::MalformedReport(e.to_string()))
    }

    pub fn result(ids: impl Into<Vec<TaskletId>>, value: Payload) -> Self {
        Self::Result { ids: ids.into(), value }
    }

    pub fn cancelled(id: TaskletId) -> Self {
        Self::Cancelled { id }
    }

    pub fn failure(ids: impl Into<Vec<TaskletId>>, error: impl Into<String>) -> Self {
        Self::Failure { ids: ids.into(), error: error.into() }
    }

    /// Tasklets covered by this record.
    pub fn ids(&self) -> Vec<TaskletId> {
        match self {
            Self::Result { ids, .. } | Self::Failure { ids, .. } => ids.clone(),
            Self::Cancelled { id } => vec![*id],
        }
    }
}

/// Ordered batch of outcome records from a single worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub reports: Vec<TaskletReport>,
}

impl WorkerReport {
    pub fn new(reports: Vec<TaskletReport>) -> Self {
        Self { reports }
    }

    pub fn single(report: TaskletReport) -> Self {
        Self { reports: vec![report] }
    }

    /// Decode a JSON-encoded report.
    ///
    /// A record tagged outside the closed set fails the batch with the fatal
    /// [`SchedulerError::UnknownReport`]. Anything else that does not parse
    /// (bad JSON, missing fields, missing tag) is
    /// [`SchedulerError::MalformedReport`].
    pub fn decode(bytes: &[u8]) -> Result<Self, SchedulerError> {
        #[derive(Deserialize)]
        struct Raw {
            reports: Vec<Value>,
        }

        let raw: Raw = serde_json::from_slice(bytes)
            .map_err(|e| SchedulerError::MalformedReport(e.to_string()))?;
        let reports = raw
            .reports
            .into_iter()
            .map(TaskletReport::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { reports })
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

impl From<Vec<TaskletReport>> for WorkerReport {
    fn from(reports: Vec<TaskletReport>) -> Self {
        Self::new(reports)
    }
}
