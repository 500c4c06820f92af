//! Physical layout of a queue table.
//!
//! A `QueueTableSchema` names the fixed columns every queue table carries and
//! the ordered list of caller-declared extension columns. One schema is shared
//! by every queue hosted in the tables of a shard.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::identifier::validate_identifier;

/// Column names of a queue table.
///
/// Built through [`QueueTableSchema::builder`]; construction checks that every
/// name is a plain identifier, that no name repeats and that extension columns
/// do not shadow a fixed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QueueTableSchemaBuilder", into = "QueueTableSchemaBuilder")]
pub struct QueueTableSchema {
    id_field: String,
    queue_name_field: String,
    payload_field: String,
    attempt_field: String,
    reenqueue_attempt_field: String,
    total_attempt_field: String,
    created_at_field: String,
    next_process_at_field: String,
    ext_fields: Vec<String>,
}

impl QueueTableSchema {
    pub fn builder() -> QueueTableSchemaBuilder {
        QueueTableSchemaBuilder::default()
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn queue_name_field(&self) -> &str {
        &self.queue_name_field
    }

    pub fn payload_field(&self) -> &str {
        &self.payload_field
    }

    pub fn attempt_field(&self) -> &str {
        &self.attempt_field
    }

    pub fn reenqueue_attempt_field(&self) -> &str {
        &self.reenqueue_attempt_field
    }

    pub fn total_attempt_field(&self) -> &str {
        &self.total_attempt_field
    }

    pub fn created_at_field(&self) -> &str {
        &self.created_at_field
    }

    pub fn next_process_at_field(&self) -> &str {
        &self.next_process_at_field
    }

    /// Extension columns in declaration order.
    pub fn ext_fields(&self) -> &[String] {
        &self.ext_fields
    }

    pub fn has_ext_field(&self, name: &str) -> bool {
        self.ext_fields.iter().any(|f| f == name)
    }

    fn fixed_fields(&self) -> [&str; 8] {
        [
            &self.id_field,
            &self.queue_name_field,
            &self.payload_field,
            &self.attempt_field,
            &self.reenqueue_attempt_field,
            &self.total_attempt_field,
            &self.created_at_field,
            &self.next_process_at_field,
        ]
    }

    fn validate(&self) -> ConfigResult<()> {
        let mut seen = BTreeSet::new();
        for name in self
            .fixed_fields()
            .into_iter()
            .chain(self.ext_fields.iter().map(String::as_str))
        {
            validate_identifier(name)?;
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(ConfigError::DuplicateColumn(name.to_string()));
            }
        }
        Ok(())
    }
}

impl Default for QueueTableSchema {
    fn default() -> Self {
        let b = QueueTableSchemaBuilder::default();
        Self {
            id_field: b.id_field,
            queue_name_field: b.queue_name_field,
            payload_field: b.payload_field,
            attempt_field: b.attempt_field,
            reenqueue_attempt_field: b.reenqueue_attempt_field,
            total_attempt_field: b.total_attempt_field,
            created_at_field: b.created_at_field,
            next_process_at_field: b.next_process_at_field,
            ext_fields: Vec::new(),
        }
    }
}

/// Builder for [`QueueTableSchema`], starting from the conventional column names.
///
/// Also the serialized form of a schema; missing keys take their default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueTableSchemaBuilder {
    id_field: String,
    queue_name_field: String,
    payload_field: String,
    attempt_field: String,
    reenqueue_attempt_field: String,
    total_attempt_field: String,
    created_at_field: String,
    next_process_at_field: String,
    ext_fields: Vec<String>,
}

impl Default for QueueTableSchemaBuilder {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            queue_name_field: "queue_name".to_string(),
            payload_field: "payload".to_string(),
            attempt_field: "attempt".to_string(),
            reenqueue_attempt_field: "reenqueue_attempt".to_string(),
            total_attempt_field: "total_attempt".to_string(),
            created_at_field: "created_at".to_string(),
            next_process_at_field: "next_process_at".to_string(),
            ext_fields: Vec::new(),
        }
    }
}

impl QueueTableSchemaBuilder {
    pub fn id_field(mut self, name: impl Into<String>) -> Self {
        self.id_field = name.into();
        self
    }

    pub fn queue_name_field(mut self, name: impl Into<String>) -> Self {
        self.queue_name_field = name.into();
        self
    }

    pub fn payload_field(mut self, name: impl Into<String>) -> Self {
        self.payload_field = name.into();
        self
    }

    pub fn attempt_field(mut self, name: impl Into<String>) -> Self {
        self.attempt_field = name.into();
        self
    }

    pub fn reenqueue_attempt_field(mut self, name: impl Into<String>) -> Self {
        self.reenqueue_attempt_field = name.into();
        self
    }

    pub fn total_attempt_field(mut self, name: impl Into<String>) -> Self {
        self.total_attempt_field = name.into();
        self
    }

    pub fn created_at_field(mut self, name: impl Into<String>) -> Self {
        self.created_at_field = name.into();
        self
    }

    pub fn next_process_at_field(mut self, name: impl Into<String>) -> Self {
        self.next_process_at_field = name.into();
        self
    }

    pub fn ext_field(mut self, name: impl Into<String>) -> Self {
        self.ext_fields.push(name.into());
        self
    }

    pub fn ext_fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ext_fields.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> ConfigResult<QueueTableSchema> {
        let schema = QueueTableSchema {
            id_field: self.id_field,
            queue_name_field: self.queue_name_field,
            payload_field: self.payload_field,
            attempt_field: self.attempt_field,
            reenqueue_attempt_field: self.reenqueue_attempt_field,
            total_attempt_field: self.total_attempt_field,
            created_at_field: self.created_at_field,
            next_process_at_field: self.next_process_at_field,
            ext_fields: self.ext_fields,
        };
        schema.validate()?;
        Ok(schema)
    }
}

impl TryFrom<QueueTableSchemaBuilder> for QueueTableSchema {
    type Error = ConfigError;

    fn try_from(builder: QueueTableSchemaBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

impl From<QueueTableSchema> for QueueTableSchemaBuilder {
    fn from(schema: QueueTableSchema) -> Self {
        Self {
            id_field: schema.id_field,
            queue_name_field: schema.queue_name_field,
            payload_field: schema.payload_field,
            attempt_field: schema.attempt_field,
            reenqueue_attempt_field: schema.reenqueue_attempt_field,
            total_attempt_field: schema.total_attempt_field,
            created_at_field: schema.created_at_field,
            next_process_at_field: schema.next_process_at_field,
            ext_fields: schema.ext_fields,
        }
    }
}
