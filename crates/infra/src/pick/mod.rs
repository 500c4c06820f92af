//! Atomic claim of the next due task.
//!
//! Each dialect selects the oldest due, unlocked row of a queue and advances
//! its retry state in one statement, skipping rows other claimants hold:
//!
//! - PostgreSQL: `FOR UPDATE SKIP LOCKED` CTE feeding `UPDATE ... RETURNING`.
//! - MSSQL: `READPAST, UPDLOCK` CTE feeding `UPDATE ... OUTPUT inserted`.
//! - Oracle 11g: anonymous block with a `SKIP LOCKED` cursor and
//!   `UPDATE ... RETURNING INTO` out-binds.
//!
//! The retry backoff is evaluated by the database from the pre-claim attempt
//! count; `reenqueue_attempt` is never touched by a claim.

pub mod mssql;
pub mod oracle;
pub mod postgres;

use std::collections::BTreeMap;
use std::sync::Arc;

use dbqueue_core::{DatabaseDialect, QueueTableSchema, TaskId, TaskRecord};

use crate::dao::QueuePickTaskDao;
use crate::database::{Database, RowAccessor, RowMappingError};

pub use mssql::MssqlQueuePickTaskDao;
pub use oracle::Oracle11QueuePickTaskDao;
pub use postgres::PostgresQueuePickTaskDao;

/// Build the claim strategy of `dialect`.
pub fn pick_task_dao<D: Database>(
    dialect: DatabaseDialect,
    schema: Arc<QueueTableSchema>,
    database: Arc<D>,
) -> Box<dyn QueuePickTaskDao> {
    match dialect {
        DatabaseDialect::Postgresql => Box::new(PostgresQueuePickTaskDao::new(database, schema)),
        DatabaseDialect::Mssql => Box::new(MssqlQueuePickTaskDao::new(database, schema)),
        DatabaseDialect::Oracle11g => Box::new(Oracle11QueuePickTaskDao::new(database, schema)),
    }
}

/// Columns a claim reads back: the fixed columns, then every extension column.
pub(crate) fn returned_columns(schema: &QueueTableSchema) -> Vec<&str> {
    let mut columns = vec![
        schema.id_field(),
        schema.payload_field(),
        schema.attempt_field(),
        schema.reenqueue_attempt_field(),
        schema.total_attempt_field(),
        schema.created_at_field(),
        schema.next_process_at_field(),
    ];
    columns.extend(schema.ext_fields().iter().map(String::as_str));
    columns
}

fn counter(row: &dyn RowAccessor, column: &str) -> Result<u64, RowMappingError> {
    let value = row.get_i64(column)?;
    u64::try_from(value).map_err(|_| RowMappingError::NegativeCounter {
        column: column.to_string(),
        value,
    })
}

/// Map a claimed row to a task snapshot.
pub fn map_task_record(
    schema: &QueueTableSchema,
    row: &dyn RowAccessor,
) -> Result<TaskRecord, RowMappingError> {
    let mut ext_data = BTreeMap::new();
    for field in schema.ext_fields() {
        ext_data.insert(field.clone(), row.get_opt_string(field)?);
    }

    Ok(TaskRecord {
        id: TaskId::new(row.get_i64(schema.id_field())?),
        created_at: row.get_timestamp(schema.created_at_field())?,
        next_process_at: row.get_timestamp(schema.next_process_at_field())?,
        payload: row.get_opt_string(schema.payload_field())?,
        attempts_count: counter(row, schema.attempt_field())?,
        reenqueue_attempts_count: counter(row, schema.reenqueue_attempt_field())?,
        total_attempts_count: counter(row, schema.total_attempt_field())?,
        ext_data,
    })
}
