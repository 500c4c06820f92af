//! `dbqueue-core`: value types of the database-backed task queue.
//!
//! This crate contains **pure** values (no I/O): table schema, queue location,
//! ids, enqueue parameters, task snapshots, retry policy and dialect tag.

pub mod dialect;
pub mod error;
pub mod id;
pub mod identifier;
pub mod location;
pub mod retry;
pub mod schema;
pub mod task;

pub use dialect::DatabaseDialect;
pub use error::{ConfigError, ConfigResult};
pub use id::{QueueId, QueueShardId, TaskId};
pub use location::QueueLocation;
pub use retry::{PickTaskSettings, TaskRetryType};
pub use schema::{QueueTableSchema, QueueTableSchemaBuilder};
pub use task::{EnqueueParams, TaskRecord};
