//! Shard configuration loading.
//!
//! Configuration comes from `DBQUEUE_*` environment variables or from JSON.
//! Everything is validated while loading, so a shard built from a loaded
//! config can not fail later on a malformed name.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use dbqueue_core::{
    ConfigError, DatabaseDialect, PickTaskSettings, QueueShardId, QueueTableSchema,
    QueueTableSchemaBuilder, TaskRetryType,
};

pub const SHARD_ID_VAR: &str = "DBQUEUE_SHARD_ID";
pub const DIALECT_VAR: &str = "DBQUEUE_DIALECT";
pub const EXT_FIELDS_VAR: &str = "DBQUEUE_EXT_FIELDS";
pub const RETRY_TYPE_VAR: &str = "DBQUEUE_RETRY_TYPE";
pub const RETRY_INTERVAL_VAR: &str = "DBQUEUE_RETRY_INTERVAL_SECS";

type ColumnOverride = fn(QueueTableSchemaBuilder, String) -> QueueTableSchemaBuilder;

const COLUMN_OVERRIDES: [(&str, ColumnOverride); 8] = [
    ("DBQUEUE_ID_FIELD", QueueTableSchemaBuilder::id_field),
    ("DBQUEUE_QUEUE_NAME_FIELD", QueueTableSchemaBuilder::queue_name_field),
    ("DBQUEUE_PAYLOAD_FIELD", QueueTableSchemaBuilder::payload_field),
    ("DBQUEUE_ATTEMPT_FIELD", QueueTableSchemaBuilder::attempt_field),
    (
        "DBQUEUE_REENQUEUE_ATTEMPT_FIELD",
        QueueTableSchemaBuilder::reenqueue_attempt_field,
    ),
    ("DBQUEUE_TOTAL_ATTEMPT_FIELD", QueueTableSchemaBuilder::total_attempt_field),
    ("DBQUEUE_CREATED_AT_FIELD", QueueTableSchemaBuilder::created_at_field),
    ("DBQUEUE_NEXT_PROCESS_AT_FIELD", QueueTableSchemaBuilder::next_process_at_field),
];

/// Everything needed to build a [`QueueShard`](crate::shard::QueueShard)
/// besides the database itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueShardConfig {
    pub shard_id: QueueShardId,
    pub dialect: DatabaseDialect,
    #[serde(default)]
    pub schema: QueueTableSchema,
}

impl QueueShardConfig {
    pub fn new(shard_id: QueueShardId, dialect: DatabaseDialect, schema: QueueTableSchema) -> Self {
        Self {
            shard_id,
            dialect,
            schema,
        }
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through `lookup`, which returns the value of a variable if set.
    ///
    /// `DBQUEUE_SHARD_ID` and `DBQUEUE_DIALECT` are required. Column names
    /// default to the conventional ones; `DBQUEUE_EXT_FIELDS` is a comma
    /// separated list.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let shard_id = required(&lookup, SHARD_ID_VAR)?.parse::<QueueShardId>()?;
        let dialect = required(&lookup, DIALECT_VAR)?.parse::<DatabaseDialect>()?;

        let mut builder = QueueTableSchema::builder();
        for (key, apply) in COLUMN_OVERRIDES {
            if let Some(name) = optional(&lookup, key) {
                builder = apply(builder, name);
            }
        }
        if let Some(list) = optional(&lookup, EXT_FIELDS_VAR) {
            builder = builder.ext_fields(
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty()),
            );
        }

        Ok(Self::new(shard_id, dialect, builder.build()?))
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::invalid_value("shard config", e.to_string()))
    }
}

/// Retry policy from `DBQUEUE_RETRY_TYPE` and `DBQUEUE_RETRY_INTERVAL_SECS`.
pub fn pick_settings_from_env() -> Result<PickTaskSettings, ConfigError> {
    pick_settings_from_lookup(|key| std::env::var(key).ok())
}

/// Retry policy through `lookup`; unset variables keep the defaults.
pub fn pick_settings_from_lookup<F>(lookup: F) -> Result<PickTaskSettings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = PickTaskSettings::default();
    if let Some(retry_type) = optional(&lookup, RETRY_TYPE_VAR) {
        settings.retry_type = retry_type.parse::<TaskRetryType>()?;
    }
    if let Some(secs) = optional(&lookup, RETRY_INTERVAL_VAR) {
        let secs = secs
            .parse::<u64>()
            .map_err(|e| ConfigError::invalid_value(RETRY_INTERVAL_VAR, e.to_string()))?;
        settings.retry_interval = Duration::from_secs(secs);
    }
    Ok(settings)
}

fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, key).ok_or_else(|| ConfigError::invalid_value(key, "must be set"))
}
