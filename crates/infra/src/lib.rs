//! Infrastructure layer: queue storage strategies over a database facade.
//!
//! A [`QueueShard`] binds one [`Database`] to the strategies of its dialect:
//! [`QueueDao`] for enqueue, delete and reenqueue, and [`QueuePickTaskDao`] for
//! the atomic claim of the next due task.

pub mod config;
pub mod dao;
pub mod database;
pub mod pick;
pub mod shard;
pub mod sql_cache;

pub use config::{QueueShardConfig, pick_settings_from_env, pick_settings_from_lookup};
pub use dao::{QueueDao, QueueDaoError, QueuePickTaskDao};
pub use database::{Database, DatabaseError, PgDatabase, RowMappingError};
#[cfg(any(test, feature = "testing"))]
pub use database::RecordingDatabase;
pub use shard::QueueShard;
