//! Configuration error model.

use thiserror::Error;

/// Result type used by the value-type constructors.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration-level error.
///
/// Every variant describes a mistake in how a queue, shard or schema was set
/// up. These are fatal: they are raised at the point of use and never retried.
/// Database failures belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A dialect tag did not name a supported database.
    #[error("unsupported database dialect: {0}")]
    UnknownDialect(String),

    /// A retry type tag did not name a supported backoff.
    #[error("unknown retry type: {0}")]
    UnknownRetryType(String),

    /// The dialect needs an id sequence but the queue location has none.
    #[error("id sequence must be specified for {dialect} database (table {table_name})")]
    MissingIdSequence {
        dialect: String,
        table_name: String,
    },

    /// A table, column or sequence name is not a plain SQL identifier.
    #[error("invalid sql identifier: {0:?}")]
    InvalidIdentifier(String),

    /// The same column name appears twice in a table schema.
    #[error("duplicate column in queue table schema: {0}")]
    DuplicateColumn(String),

    /// Enqueue parameters reference a column the schema does not declare.
    #[error("unknown extension column: {0}")]
    UnknownExtensionColumn(String),

    /// A configuration value was missing or malformed.
    #[error("invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub fn invalid_identifier(name: impl Into<String>) -> Self {
        Self::InvalidIdentifier(name.into())
    }

    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn missing_id_sequence(dialect: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self::MissingIdSequence {
            dialect: dialect.into(),
            table_name: table_name.into(),
        }
    }
}
