//! Queue table access: enqueue, delete and reenqueue.
//!
//! One implementation per dialect renders the statements for a queue location
//! once, caches the text and runs it through the shard's [`Database`]. The
//! dialect is picked by [`queue_dao`] when the shard is built.

pub mod mssql;
pub mod oracle;
pub mod params;
pub mod postgres;
pub mod r#trait;

use std::sync::Arc;

use dbqueue_core::{DatabaseDialect, QueueLocation, QueueTableSchema};

use crate::database::Database;

pub use mssql::MssqlQueueDao;
pub use oracle::Oracle11QueueDao;
pub use postgres::PostgresQueueDao;
pub use r#trait::{QueueDao, QueueDaoError, QueuePickTaskDao};

use params::{EXECUTION_DELAY, ID, PAYLOAD, QUEUE_NAME, ext_param};

/// Build the enqueue/delete/reenqueue strategy of `dialect`.
pub fn queue_dao<D: Database>(
    dialect: DatabaseDialect,
    schema: Arc<QueueTableSchema>,
    database: Arc<D>,
) -> Box<dyn QueueDao> {
    match dialect {
        DatabaseDialect::Postgresql => Box::new(PostgresQueueDao::new(database, schema)),
        DatabaseDialect::Mssql => Box::new(MssqlQueueDao::new(database, schema)),
        DatabaseDialect::Oracle11g => Box::new(Oracle11QueueDao::new(database, schema)),
    }
}

/// Column and value lists of the enqueue insert.
///
/// `id_value` is the SQL expression for an explicit id, if the dialect passes
/// one. Counters start at zero; `created_at` is left to the column default.
pub(crate) fn insert_lists(
    schema: &QueueTableSchema,
    id_value: Option<&str>,
    next_process_at: &str,
) -> (String, String) {
    let mut columns: Vec<String> = Vec::with_capacity(7 + schema.ext_fields().len());
    let mut values: Vec<String> = Vec::with_capacity(columns.capacity());

    if let Some(id) = id_value {
        columns.push(schema.id_field().to_string());
        values.push(id.to_string());
    }
    for (column, value) in [
        (schema.queue_name_field(), format!(":{QUEUE_NAME}")),
        (schema.payload_field(), format!(":{PAYLOAD}")),
        (schema.next_process_at_field(), next_process_at.to_string()),
        (schema.attempt_field(), "0".to_string()),
        (schema.reenqueue_attempt_field(), "0".to_string()),
        (schema.total_attempt_field(), "0".to_string()),
    ] {
        columns.push(column.to_string());
        values.push(value);
    }
    for ext in schema.ext_fields() {
        columns.push(ext.clone());
        values.push(format!(":{}", ext_param(ext)));
    }

    (columns.join(", "), values.join(", "))
}

/// Delete statement; identical for every dialect.
pub(crate) fn render_delete(schema: &QueueTableSchema, location: &QueueLocation) -> String {
    format!(
        "DELETE FROM {table} WHERE {queue_name} = :{QUEUE_NAME} AND {id} = :{ID}",
        table = location.table_name(),
        queue_name = schema.queue_name_field(),
        id = schema.id_field(),
    )
}

/// Reenqueue statement around a dialect's "now + delay" expression.
pub(crate) fn render_reenqueue(
    schema: &QueueTableSchema,
    location: &QueueLocation,
    next_process_at: &str,
) -> String {
    format!(
        "UPDATE {table} SET {next_process_at_field} = {next_process_at}, {attempt} = 0, \
         {reenqueue} = {reenqueue} + 1 WHERE {id} = :{ID} AND {queue_name} = :{QUEUE_NAME}",
        table = location.table_name(),
        next_process_at_field = schema.next_process_at_field(),
        attempt = schema.attempt_field(),
        reenqueue = schema.reenqueue_attempt_field(),
        id = schema.id_field(),
        queue_name = schema.queue_name_field(),
    )
}

/// `:executionDelay` placeholder, shared by enqueue and reenqueue.
pub(crate) fn execution_delay_param() -> String {
    format!(":{EXECUTION_DELAY}")
}
