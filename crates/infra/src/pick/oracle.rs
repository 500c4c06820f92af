//! Oracle 11g claim.
//!
//! 11g has no `FETCH FIRST` and rejects `FOR UPDATE` together with `ROWNUM`
//! ordering, so the claim runs as an anonymous block: an ordered
//! `FOR UPDATE SKIP LOCKED` cursor locks the first due row it can get, then
//! `UPDATE ... RETURNING INTO` advances it and hands the new values back
//! through out-binds. A NULL id out-bind means no row was claimed.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{Span, debug, instrument};

use dbqueue_core::{
    DatabaseDialect, PickTaskSettings, QueueLocation, QueueTableSchema, TaskRecord, TaskRetryType,
};

use super::{map_task_record, returned_columns};
use crate::dao::params::{PickTaskArgs, QUEUE_NAME, RETRY_INTERVAL};
use crate::dao::{QueueDaoError, QueuePickTaskDao};
use crate::database::{Database, OutParam, RowAccessor, RowMappingError, SqlType};
use crate::sql_cache::SqlCache;

fn out_bind(position: usize) -> String {
    format!("out_{position}")
}

/// Claim strategy built on a PL/SQL block with `SKIP LOCKED` cursor.
pub struct Oracle11QueuePickTaskDao<D> {
    database: Arc<D>,
    schema: Arc<QueueTableSchema>,
    pick_sql: SqlCache<(QueueLocation, TaskRetryType)>,
    outputs: Vec<OutParam>,
}

impl<D: Database> Oracle11QueuePickTaskDao<D> {
    pub fn new(database: Arc<D>, schema: Arc<QueueTableSchema>) -> Self {
        let outputs = out_params(&schema);
        Self {
            database,
            schema,
            pick_sql: SqlCache::new(),
            outputs,
        }
    }

    pub fn pick_task_sql(&self, location: &QueueLocation, retry_type: TaskRetryType) -> Arc<str> {
        let key = (location.clone(), retry_type);
        let Ok(sql) = self.pick_sql.get_or_try_insert(&key, || {
            let sql = render_pick(&self.schema, location, retry_type);
            debug!(%location, %retry_type, %sql, "rendered oracle claim");
            Ok::<_, Infallible>(Arc::from(sql))
        });
        sql
    }

    /// Out-binds of the claim block, one per returned column.
    pub fn out_params(&self) -> &[OutParam] {
        &self.outputs
    }
}

fn out_params(schema: &QueueTableSchema) -> Vec<OutParam> {
    let timestamps = [schema.created_at_field(), schema.next_process_at_field()];
    let integers = [
        schema.id_field(),
        schema.attempt_field(),
        schema.reenqueue_attempt_field(),
        schema.total_attempt_field(),
    ];
    returned_columns(schema)
        .into_iter()
        .enumerate()
        .map(|(position, column)| {
            let kind = if integers.contains(&column) {
                SqlType::BigInt
            } else if timestamps.contains(&column) {
                SqlType::Timestamp
            } else {
                SqlType::Text
            };
            OutParam::new(out_bind(position), kind)
        })
        .collect()
}

fn next_process_at(schema: &QueueTableSchema, retry_type: TaskRetryType) -> String {
    let attempt = schema.attempt_field();
    let factor = match retry_type {
        TaskRetryType::GeometricBackoff => format!("power(2, {attempt}) * "),
        TaskRetryType::ArithmeticBackoff => format!("(1 + ({attempt} * 2)) * "),
        TaskRetryType::LinearBackoff => String::new(),
    };
    format!("CURRENT_TIMESTAMP + {factor}:{RETRY_INTERVAL} * INTERVAL '1' SECOND")
}

pub(crate) fn render_pick(
    schema: &QueueTableSchema,
    location: &QueueLocation,
    retry_type: TaskRetryType,
) -> String {
    let columns = returned_columns(schema);
    let into = (0..columns.len())
        .map(|position| format!(":{}", out_bind(position)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "DECLARE rid ROWID; \
         CURSOR c IS SELECT rowid FROM {table} WHERE {queue_name} = :{QUEUE_NAME} \
         AND {next} <= CURRENT_TIMESTAMP ORDER BY {next} ASC FOR UPDATE SKIP LOCKED; \
         BEGIN OPEN c; FETCH c INTO rid; CLOSE c; \
         IF rid IS NOT NULL THEN \
         UPDATE {table} SET {next} = {backoff}, {attempt} = {attempt} + 1, {total} = {total} + 1 \
         WHERE rowid = rid RETURNING {returning} INTO {into}; \
         END IF; END;",
        table = location.table_name(),
        queue_name = schema.queue_name_field(),
        next = schema.next_process_at_field(),
        backoff = next_process_at(schema, retry_type),
        attempt = schema.attempt_field(),
        total = schema.total_attempt_field(),
        returning = columns.join(", "),
    )
}

/// Reads out-binds by the column they were returned from.
struct OutBindRow<'a> {
    columns: Vec<&'a str>,
    row: &'a dyn RowAccessor,
}

impl OutBindRow<'_> {
    fn bind_name(&self, column: &str) -> Result<String, RowMappingError> {
        self.columns
            .iter()
            .position(|c| *c == column)
            .map(out_bind)
            .ok_or_else(|| RowMappingError::MissingColumn(column.to_string()))
    }
}

impl RowAccessor for OutBindRow<'_> {
    fn get_opt_i64(&self, column: &str) -> Result<Option<i64>, RowMappingError> {
        self.row.get_opt_i64(&self.bind_name(column)?)
    }

    fn get_opt_string(&self, column: &str) -> Result<Option<String>, RowMappingError> {
        self.row.get_opt_string(&self.bind_name(column)?)
    }

    fn get_opt_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, RowMappingError> {
        self.row.get_opt_timestamp(&self.bind_name(column)?)
    }
}

#[async_trait]
impl<D: Database> QueuePickTaskDao for Oracle11QueuePickTaskDao<D> {
    fn dialect(&self) -> DatabaseDialect {
        DatabaseDialect::Oracle11g
    }

    #[instrument(
        skip(self, location, settings),
        fields(
            table = %location.table_name(),
            queue = %location.queue_id(),
            retry_type = %settings.retry_type,
            task_id = tracing::field::Empty
        ),
        err
    )]
    async fn pick_task(
        &self,
        location: &QueueLocation,
        settings: &PickTaskSettings,
    ) -> Result<Option<TaskRecord>, QueueDaoError> {
        let args = PickTaskArgs::new(location, settings);
        let sql = self.pick_task_sql(location, settings.retry_type);
        let schema = &*self.schema;
        let mapper = |row: &dyn RowAccessor| -> Result<Option<TaskRecord>, RowMappingError> {
            let out = OutBindRow {
                columns: returned_columns(schema),
                row,
            };
            match out.get_opt_i64(schema.id_field())? {
                None => Ok(None),
                Some(_) => map_task_record(schema, &out).map(Some),
            }
        };

        let task = self
            .database
            .call(&sql, &args.to_params(), &self.outputs, &mapper)
            .await?;
        if let Some(task) = &task {
            Span::current().record("task_id", task.id.value());
        }
        Ok(task)
    }
}
