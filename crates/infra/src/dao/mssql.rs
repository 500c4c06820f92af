//! Microsoft SQL Server queue strategy.
//!
//! The id comes from an identity column, or from `NEXT VALUE FOR` inline when
//! the location names a sequence, and is read back with `OUTPUT inserted`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{Span, debug, instrument};

use dbqueue_core::{DatabaseDialect, EnqueueParams, QueueLocation, QueueTableSchema, TaskId};

use super::params::{DeleteArgs, EnqueueArgs, ReenqueueArgs};
use super::r#trait::{QueueDao, QueueDaoError};
use super::{execution_delay_param, insert_lists, render_delete, render_reenqueue};
use crate::database::{Database, DatabaseError, RowAccessor, RowMappingError};
use crate::sql_cache::SqlCache;

/// `dateadd` takes an `int`, so whole seconds and the millisecond remainder
/// are added separately.
fn delayed_now() -> String {
    let delay = execution_delay_param();
    format!("dateadd(ms, {delay} % 1000, dateadd(ss, {delay} / 1000, SYSDATETIMEOFFSET()))")
}

pub struct MssqlQueueDao<D> {
    database: Arc<D>,
    schema: Arc<QueueTableSchema>,
    enqueue_sql: SqlCache<QueueLocation>,
    delete_sql: SqlCache<QueueLocation>,
    reenqueue_sql: SqlCache<QueueLocation>,
}

impl<D: Database> MssqlQueueDao<D> {
    pub fn new(database: Arc<D>, schema: Arc<QueueTableSchema>) -> Self {
        Self {
            database,
            schema,
            enqueue_sql: SqlCache::new(),
            delete_sql: SqlCache::new(),
            reenqueue_sql: SqlCache::new(),
        }
    }

    pub fn enqueue_sql(&self, location: &QueueLocation) -> Arc<str> {
        let Ok(sql) = self.enqueue_sql.get_or_try_insert(location, || {
            let id_value = location
                .id_sequence()
                .map(|seq| format!("NEXT VALUE FOR {seq}"));
            let (columns, values) = insert_lists(&self.schema, id_value.as_deref(), &delayed_now());
            let sql = format!(
                "INSERT INTO {table} ({columns}) OUTPUT inserted.{id} VALUES ({values})",
                table = location.table_name(),
                id = self.schema.id_field(),
            );
            debug!(%location, %sql, "rendered mssql enqueue");
            Ok::<_, Infallible>(Arc::from(sql))
        });
        sql
    }

    pub fn delete_sql(&self, location: &QueueLocation) -> Arc<str> {
        let Ok(sql) = self.delete_sql.get_or_try_insert(location, || {
            Ok::<_, Infallible>(Arc::from(render_delete(&self.schema, location)))
        });
        sql
    }

    pub fn reenqueue_sql(&self, location: &QueueLocation) -> Arc<str> {
        let Ok(sql) = self.reenqueue_sql.get_or_try_insert(location, || {
            let sql = render_reenqueue(&self.schema, location, &delayed_now());
            debug!(%location, %sql, "rendered mssql reenqueue");
            Ok::<_, Infallible>(Arc::from(sql))
        });
        sql
    }
}

#[async_trait]
impl<D: Database> QueueDao for MssqlQueueDao<D> {
    fn dialect(&self) -> DatabaseDialect {
        DatabaseDialect::Mssql
    }

    #[instrument(
        skip(self, location, params),
        fields(table = %location.table_name(), queue = %location.queue_id(), task_id = tracing::field::Empty),
        err
    )]
    async fn enqueue(
        &self,
        location: &QueueLocation,
        params: &EnqueueParams,
    ) -> Result<TaskId, QueueDaoError> {
        let args = EnqueueArgs::new(&self.schema, location, params)?;
        let sql = self.enqueue_sql(location);
        let id_field = self.schema.id_field();
        let mapper = |row: &dyn RowAccessor| -> Result<TaskId, RowMappingError> {
            row.get_i64(id_field).map(TaskId::new)
        };

        let id = self
            .database
            .select_one(&sql, &args.to_params(), &mapper)
            .await?
            .ok_or_else(|| DatabaseError::Backend("insert returned no id".to_string()))?;
        Span::current().record("task_id", id.value());
        Ok(id)
    }

    #[instrument(
        skip(self, location),
        fields(table = %location.table_name(), queue = %location.queue_id()),
        err
    )]
    async fn delete_task(
        &self,
        location: &QueueLocation,
        task_id: TaskId,
    ) -> Result<bool, QueueDaoError> {
        let args = DeleteArgs::new(location, task_id);
        let sql = self.delete_sql(location);
        Ok(self.database.update(&sql, &args.to_params()).await? > 0)
    }

    #[instrument(
        skip(self, location),
        fields(table = %location.table_name(), queue = %location.queue_id()),
        err
    )]
    async fn reenqueue(
        &self,
        location: &QueueLocation,
        task_id: TaskId,
        execution_delay: Duration,
    ) -> Result<bool, QueueDaoError> {
        let args = ReenqueueArgs::new(location, task_id, execution_delay);
        let sql = self.reenqueue_sql(location);
        Ok(self.database.update(&sql, &args.to_params()).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MemoryRow, RecordingDatabase, SqlValue};
    use dbqueue_core::QueueId;

    fn dao() -> (Arc<RecordingDatabase>, MssqlQueueDao<RecordingDatabase>) {
        let db = Arc::new(RecordingDatabase::new());
        (Arc::clone(&db), MssqlQueueDao::new(db, Arc::new(QueueTableSchema::default())))
    }

    fn location() -> QueueLocation {
        QueueLocation::new("dbo.queue_tasks", QueueId::new("mail")).unwrap()
    }

    #[tokio::test]
    async fn enqueue_reads_identity_through_output_clause() {
        let (db, dao) = dao();
        db.push_rows(vec![MemoryRow::new().with("id", 12i64)]);

        let id = dao
            .enqueue(&location(), &EnqueueParams::new().with_payload("{}"))
            .await
            .unwrap();
        assert_eq!(id, TaskId::new(12));
        assert_eq!(
            db.last_statement().unwrap().sql,
            "INSERT INTO dbo.queue_tasks (queue_name, payload, next_process_at, attempt, reenqueue_attempt, total_attempt) \
             OUTPUT inserted.id VALUES (:queueName, :payload, dateadd(ms, :executionDelay % 1000, dateadd(ss, :executionDelay / 1000, SYSDATETIMEOFFSET())), 0, 0, 0)"
        );
    }

    #[tokio::test]
    async fn enqueue_with_sequence_inlines_next_value() {
        let (db, dao) = dao();
        db.push_rows(vec![MemoryRow::new().with("id", 1i64)]);
        let location = location().with_id_sequence("dbo.task_ids").unwrap();

        dao.enqueue(&location, &EnqueueParams::new()).await.unwrap();
        let sql = db.last_statement().unwrap().sql;
        assert!(sql.contains("(id, queue_name,"));
        assert!(sql.contains("VALUES (NEXT VALUE FOR dbo.task_ids, :queueName,"));
    }

    #[tokio::test]
    async fn reenqueue_uses_dateadd() {
        let (db, dao) = dao();
        db.push_affected(1);
        assert!(
            dao.reenqueue(&location(), TaskId::new(5), Duration::from_secs(60))
                .await
                .unwrap()
        );
        let stmt = db.last_statement().unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE dbo.queue_tasks SET next_process_at = \
             dateadd(ms, :executionDelay % 1000, dateadd(ss, :executionDelay / 1000, SYSDATETIMEOFFSET())), \
             attempt = 0, reenqueue_attempt = reenqueue_attempt + 1 WHERE id = :id AND queue_name = :queueName"
        );
        assert_eq!(stmt.params.get("executionDelay"), Some(&SqlValue::BigInt(60_000)));
    }

    #[tokio::test]
    async fn delete_missing_task_is_false() {
        let (_db, dao) = dao();
        assert!(!dao.delete_task(&location(), TaskId::new(1)).await.unwrap());
    }
}
