//! Task values crossing the queue boundary.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::TaskId;

/// Input of an enqueue call.
///
/// `ext_data` keys must name extension columns of the target table's schema;
/// the check happens when the statement is rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueParams {
    payload: Option<String>,
    execution_delay: Duration,
    ext_data: BTreeMap<String, String>,
}

impl EnqueueParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Delay before the task becomes eligible. Truncated to whole seconds.
    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = delay;
        self
    }

    pub fn with_ext(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.ext_data.insert(column.into(), value.into());
        self
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub fn execution_delay(&self) -> Duration {
        self.execution_delay
    }

    pub fn ext_data(&self) -> &BTreeMap<String, String> {
        &self.ext_data
    }
}

/// Snapshot of a claimed task row, as returned by the claim statement.
///
/// Counters hold the values after the claim. Every extension column of the
/// schema has an entry; `None` stands for SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub created_at: DateTime<Utc>,
    pub next_process_at: DateTime<Utc>,
    pub payload: Option<String>,
    pub attempts_count: u64,
    pub reenqueue_attempts_count: u64,
    pub total_attempts_count: u64,
    pub ext_data: BTreeMap<String, Option<String>>,
}

impl TaskRecord {
    pub fn ext(&self, column: &str) -> Option<&str> {
        self.ext_data.get(column).and_then(|v| v.as_deref())
    }
}
