//! Where a logical queue lives.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::id::QueueId;
use crate::identifier::validate_qualified_name;

/// A logical queue: physical table, queue name and optional id sequence.
///
/// `(table_name, queue_id)` selects the rows of one queue. The id sequence is
/// only required by dialects without identity columns. Locations are used as
/// SQL text cache keys, so they are cheap to hash and compare.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawQueueLocation", into = "RawQueueLocation")]
pub struct QueueLocation {
    table_name: String,
    queue_id: QueueId,
    id_sequence: Option<String>,
}

impl QueueLocation {
    /// Fails on an unsafe table name or a blank queue id.
    pub fn new(table_name: impl Into<String>, queue_id: QueueId) -> ConfigResult<Self> {
        let table_name = table_name.into();
        validate_qualified_name(&table_name)?;
        if queue_id.as_str().trim().is_empty() {
            return Err(ConfigError::invalid_value("queue_id", "must not be empty"));
        }
        Ok(Self {
            table_name,
            queue_id,
            id_sequence: None,
        })
    }

    /// Attach the sequence that generates task ids for this table.
    pub fn with_id_sequence(mut self, sequence: impl Into<String>) -> ConfigResult<Self> {
        let sequence = sequence.into();
        validate_qualified_name(&sequence)?;
        self.id_sequence = Some(sequence);
        Ok(self)
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    pub fn id_sequence(&self) -> Option<&str> {
        self.id_sequence.as_deref()
    }
}

impl core::fmt::Display for QueueLocation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.table_name, self.queue_id)
    }
}

#[derive(Serialize, Deserialize)]
struct RawQueueLocation {
    table_name: String,
    queue_id: QueueId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_sequence: Option<String>,
}

impl TryFrom<RawQueueLocation> for QueueLocation {
    type Error = ConfigError;

    fn try_from(raw: RawQueueLocation) -> Result<Self, Self::Error> {
        let location = QueueLocation::new(raw.table_name, raw.queue_id)?;
        match raw.id_sequence {
            Some(seq) => location.with_id_sequence(seq),
            None => Ok(location),
        }
    }
}

impl From<QueueLocation> for RawQueueLocation {
    fn from(location: QueueLocation) -> Self {
        Self {
            table_name: location.table_name,
            queue_id: location.queue_id,
            id_sequence: location.id_sequence,
        }
    }
}
