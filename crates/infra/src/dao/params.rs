//! Parameter records of the queue statements.
//!
//! Each statement gets one immutable record naming exactly the values it
//! binds. Records turn into [`SqlParams`] right before execution.

use std::time::Duration;

use dbqueue_core::{
    ConfigError, EnqueueParams, PickTaskSettings, QueueLocation, QueueTableSchema, TaskId,
};

use crate::database::SqlParams;

pub const QUEUE_NAME: &str = "queueName";
pub const PAYLOAD: &str = "payload";
pub const EXECUTION_DELAY: &str = "executionDelay";
pub const ID: &str = "id";
pub const RETRY_INTERVAL: &str = "retryInterval";

/// Placeholder name of an extension column value.
///
/// Prefixed so that extension columns never collide with the fixed names.
pub fn ext_param(column: &str) -> String {
    format!("ext_{column}")
}

/// Duration as a bindable millisecond count.
///
/// A sub-millisecond remainder rounds up, so a task never becomes eligible
/// before its full delay has passed.
pub fn delay_millis(duration: Duration) -> i64 {
    let mut millis = duration.as_millis();
    if duration.subsec_nanos() % 1_000_000 != 0 {
        millis += 1;
    }
    i64::try_from(millis).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueArgs {
    pub queue_name: String,
    pub payload: Option<String>,
    pub execution_delay_millis: i64,
    /// One entry per schema extension column, in schema order.
    pub ext_values: Vec<(String, Option<String>)>,
}

impl EnqueueArgs {
    /// Resolve enqueue parameters against the schema.
    ///
    /// Every declared extension column gets a value, NULL unless the caller
    /// supplied one. Keys the schema does not declare are rejected.
    pub fn new(
        schema: &QueueTableSchema,
        location: &QueueLocation,
        params: &EnqueueParams,
    ) -> Result<Self, ConfigError> {
        if let Some(unknown) = params.ext_data().keys().find(|k| !schema.has_ext_field(k)) {
            return Err(ConfigError::UnknownExtensionColumn(unknown.clone()));
        }

        let ext_values = schema
            .ext_fields()
            .iter()
            .map(|field| (field.clone(), params.ext_data().get(field).cloned()))
            .collect();

        Ok(Self {
            queue_name: location.queue_id().to_string(),
            payload: params.payload().map(str::to_string),
            execution_delay_millis: delay_millis(params.execution_delay()),
            ext_values,
        })
    }

    pub fn to_params(&self) -> SqlParams {
        let base = SqlParams::new()
            .with(QUEUE_NAME, self.queue_name.as_str())
            .with(PAYLOAD, self.payload.clone())
            .with(EXECUTION_DELAY, self.execution_delay_millis);
        self.ext_values.iter().fold(base, |params, (column, value)| {
            params.with(ext_param(column), value.clone())
        })
    }
}

/// Enqueue with an id drawn from a sequence beforehand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleEnqueueArgs {
    pub id: TaskId,
    pub enqueue: EnqueueArgs,
}

impl OracleEnqueueArgs {
    pub fn to_params(&self) -> SqlParams {
        self.enqueue.to_params().with(ID, self.id.value())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteArgs {
    pub queue_name: String,
    pub id: TaskId,
}

impl DeleteArgs {
    pub fn new(location: &QueueLocation, id: TaskId) -> Self {
        Self {
            queue_name: location.queue_id().to_string(),
            id,
        }
    }

    pub fn to_params(&self) -> SqlParams {
        SqlParams::new()
            .with(QUEUE_NAME, self.queue_name.as_str())
            .with(ID, self.id.value())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReenqueueArgs {
    pub queue_name: String,
    pub id: TaskId,
    pub execution_delay_millis: i64,
}

impl ReenqueueArgs {
    pub fn new(location: &QueueLocation, id: TaskId, execution_delay: Duration) -> Self {
        Self {
            queue_name: location.queue_id().to_string(),
            id,
            execution_delay_millis: delay_millis(execution_delay),
        }
    }

    pub fn to_params(&self) -> SqlParams {
        SqlParams::new()
            .with(QUEUE_NAME, self.queue_name.as_str())
            .with(ID, self.id.value())
            .with(EXECUTION_DELAY, self.execution_delay_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickTaskArgs {
    pub queue_name: String,
    pub retry_interval_secs: i64,
}

impl PickTaskArgs {
    pub fn new(location: &QueueLocation, settings: &PickTaskSettings) -> Self {
        Self {
            queue_name: location.queue_id().to_string(),
            retry_interval_secs: settings.retry_interval_secs(),
        }
    }

    pub fn to_params(&self) -> SqlParams {
        SqlParams::new()
            .with(QUEUE_NAME, self.queue_name.as_str())
            .with(RETRY_INTERVAL, self.retry_interval_secs)
    }
}
