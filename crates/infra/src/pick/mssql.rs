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

/// Claim strategy built on the `READPAST` and `UPDLOCK` table hints.
pub struct MssqlQueuePickTaskDao<D> {
    database: Arc<D>,
    schema: Arc<QueueTableSchema>,
    pick_sql: SqlCache<(QueueLocation, TaskRetryType)>,
}

impl<D: Database> MssqlQueuePickTaskDao<D> {
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
            debug!(%location, %retry_type, %sql, "rendered mssql claim");
            Ok::<_, Infallible>(Arc::from(sql))
        });
        sql
    }
}

fn next_process_at(schema: &QueueTableSchema, retry_type: TaskRetryType) -> String {
    let attempt = schema.attempt_field();
    let seconds = match retry_type {
        TaskRetryType::GeometricBackoff => format!("power(2, {attempt}) * :{RETRY_INTERVAL}"),
        TaskRetryType::ArithmeticBackoff => format!("(1 + ({attempt} * 2)) * :{RETRY_INTERVAL}"),
        TaskRetryType::LinearBackoff => format!(":{RETRY_INTERVAL}"),
    };
    format!("dateadd(ss, {seconds}, SYSDATETIMEOFFSET())")
}

pub(crate) fn render_pick(
    schema: &QueueTableSchema,
    location: &QueueLocation,
    retry_type: TaskRetryType,
) -> String {
    let output = returned_columns(schema)
        .iter()
        .map(|c| format!("inserted.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "WITH cte AS (SELECT {id} FROM {table} WITH (READPAST, UPDLOCK) \
         WHERE {queue_name} = :{QUEUE_NAME} AND {next} <= SYSDATETIMEOFFSET() \
         ORDER BY {next} ASC OFFSET 0 ROWS FETCH NEXT 1 ROWS ONLY) \
         UPDATE {table} SET {next} = {backoff}, {attempt} = {attempt} + 1, \
         {total} = {total} + 1 OUTPUT {output} FROM {table} INNER JOIN cte ON {table}.{id} = cte.{id}",
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
impl<D: Database> QueuePickTaskDao for MssqlQueuePickTaskDao<D> {
    fn dialect(&self) -> DatabaseDialect {
        DatabaseDialect::Mssql
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::database::{RecordingDatabase, StatementKind};
    use dbqueue_core::QueueId;

    fn dao() -> (Arc<RecordingDatabase>, MssqlQueuePickTaskDao<RecordingDatabase>) {
        let db = Arc::new(RecordingDatabase::new());
        (Arc::clone(&db), MssqlQueuePickTaskDao::new(db, Arc::new(QueueTableSchema::default())))
    }

    fn location() -> QueueLocation {
        QueueLocation::new("queue_tasks", QueueId::new("mail")).unwrap()
    }

    #[test]
    fn claim_statement_uses_readpast_and_output() {
        let (_db, dao) = dao();
        let sql = dao.pick_task_sql(&location(), TaskRetryType::ArithmeticBackoff);
        assert_eq!(
            &*sql,
            "WITH cte AS (SELECT id FROM queue_tasks WITH (READPAST, UPDLOCK) \
             WHERE queue_name = :queueName AND next_process_at <= SYSDATETIMEOFFSET() \
             ORDER BY next_process_at ASC OFFSET 0 ROWS FETCH NEXT 1 ROWS ONLY) \
             UPDATE queue_tasks SET next_process_at = dateadd(ss, (1 + (attempt * 2)) * :retryInterval, SYSDATETIMEOFFSET()), \
             attempt = attempt + 1, total_attempt = total_attempt + 1 \
             OUTPUT inserted.id, inserted.payload, inserted.attempt, inserted.reenqueue_attempt, \
             inserted.total_attempt, inserted.created_at, inserted.next_process_at \
             FROM queue_tasks INNER JOIN cte ON queue_tasks.id = cte.id"
        );
    }

    #[test]
    fn geometric_and_linear_backoff() {
        let (_db, dao) = dao();
        assert!(
            dao.pick_task_sql(&location(), TaskRetryType::GeometricBackoff)
                .contains("dateadd(ss, power(2, attempt) * :retryInterval, SYSDATETIMEOFFSET())")
        );
        assert!(
            dao.pick_task_sql(&location(), TaskRetryType::LinearBackoff)
                .contains("dateadd(ss, :retryInterval, SYSDATETIMEOFFSET())")
        );
    }

    #[tokio::test]
    async fn no_eligible_row_is_none() {
        let (db, dao) = dao();
        let settings = PickTaskSettings::new(TaskRetryType::LinearBackoff, Duration::from_secs(5));
        assert!(dao.pick_task(&location(), &settings).await.unwrap().is_none());
        assert_eq!(db.last_statement().unwrap().kind, StatementKind::SelectOne);
    }
}
