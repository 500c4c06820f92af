use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Span, debug, instrument};

use dbqueue_core::{
    DatabaseDialect, PickTaskSettings, QueueLocation, QueueTableSchema, TaskRecord, TaskRetryType,
};

use super::{map_task_record, returned_columns};
use crate::dao::params::{PickTaskArgs, QUEUE_NAME, RETRY_INTERVAL};
use crate::dao::{QueueDaoError, QueuePickTaskDao};
use crate::database::{Database, RowAccessor};
use crate::sql_cache::SqlCache;

/// Claim strategy built on `FOR UPDATE SKIP LOCKED`.
pub struct PostgresQueuePickTaskDao<D> {
    database: Arc<D>,
    schema: Arc<QueueTableSchema>,
    pick_sql: SqlCache<(QueueLocation, TaskRetryType)>,
}

impl<D: Database> PostgresQueuePickTaskDao<D> {
    pub fn new(database: Arc<D>, schema: Arc<QueueTableSchema>) -> Self {
        Self {
            database,
            schema,
            pick_sql: SqlCache::new(),
        }
    }

    pub fn pick_task_sql(&self, location: &QueueLocation, retry_type: TaskRetryType) -> Arc<str> {
        let key = (location.clone(), retry_type);
        let Ok(sql) = self.pick_sql.get_or_try_insert(&key, || {
            let sql = render_pick(&self.schema, location, retry_type);
            debug!(%location, %retry_type, %sql, "rendered postgresql claim");
            Ok::<_, Infallible>(Arc::from(sql))
        });
        sql
    }
}

fn next_process_at(schema: &QueueTableSchema, retry_type: TaskRetryType) -> String {
    let attempt = schema.attempt_field();
    let factor = match retry_type {
        TaskRetryType::GeometricBackoff => format!("power(2, q.{attempt}) * "),
        TaskRetryType::ArithmeticBackoff => format!("(1 + (q.{attempt} * 2)) * "),
        TaskRetryType::LinearBackoff => String::new(),
    };
    format!("now() + {factor}:{RETRY_INTERVAL} * INTERVAL '1 SECOND'")
}

pub(crate) fn render_pick(
    schema: &QueueTableSchema,
    location: &QueueLocation,
    retry_type: TaskRetryType,
) -> String {
    let returning = returned_columns(schema)
        .iter()
        .map(|c| format!("q.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "WITH cte AS (SELECT {id} FROM {table} WHERE {queue_name} = :{QUEUE_NAME} \
         AND {next} <= now() ORDER BY {next} ASC LIMIT 1 FOR UPDATE SKIP LOCKED) \
         UPDATE {table} q SET {next} = {backoff}, {attempt} = q.{attempt} + 1, \
         {total} = q.{total} + 1 FROM cte WHERE q.{id} = cte.{id} RETURNING {returning}",
        id = schema.id_field(),
        table = location.table_name(),
        queue_name = schema.queue_name_field(),
        next = schema.next_process_at_field(),
        backoff = next_process_at(schema, retry_type),
        attempt = schema.attempt_field(),
        total = schema.total_attempt_field(),
    )
}

#[async_trait]
impl<D: Database> QueuePickTaskDao for PostgresQueuePickTaskDao<D> {
    fn dialect(&self) -> DatabaseDialect {
        DatabaseDialect::Postgresql
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
        let mapper = |row: &dyn RowAccessor| map_task_record(schema, row);

        let task = self
            .database
            .select_one(&sql, &args.to_params(), &mapper)
            .await?;
        if let Some(task) = &task {
            Span::current().record("task_id", task.id.value());
        }
        Ok(task)
    }
}
