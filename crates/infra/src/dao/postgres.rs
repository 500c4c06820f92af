//! PostgreSQL queue strategy.
//!
//! Ids come from the table's identity/serial default, or from `nextval` inline
//! when the location names a sequence. Enqueue returns the id through
//! `RETURNING`, so every operation is a single statement.

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

/// `now + :executionDelay`, the delay in milliseconds.
fn delayed_now() -> String {
    format!("now() + {} * INTERVAL '1 MILLISECOND'", execution_delay_param())
}

pub struct PostgresQueueDao<D> {
    database: Arc<D>,
    schema: Arc<QueueTableSchema>,
    enqueue_sql: SqlCache<QueueLocation>,
    delete_sql: SqlCache<QueueLocation>,
    reenqueue_sql: SqlCache<QueueLocation>,
}

impl<D: Database> PostgresQueueDao<D> {
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
                .map(|seq| format!("nextval('{seq}')"));
            let (columns, values) = insert_lists(&self.schema, id_value.as_deref(), &delayed_now());
            let sql = format!(
                "INSERT INTO {table} ({columns}) VALUES ({values}) RETURNING {id}",
                table = location.table_name(),
                id = self.schema.id_field(),
            );
            debug!(%location, %sql, "rendered postgresql enqueue");
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
            debug!(%location, %sql, "rendered postgresql reenqueue");
            Ok::<_, Infallible>(Arc::from(sql))
        });
        sql
    }
}

#[async_trait]
impl<D: Database> QueueDao for PostgresQueueDao<D> {
    fn dialect(&self) -> DatabaseDialect {
        DatabaseDialect::Postgresql
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
        let affected = self.database.update(&sql, &args.to_params()).await?;
        Ok(affected > 0)
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
        let affected = self.database.update(&sql, &args.to_params()).await?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MemoryRow, RecordingDatabase, SqlValue, StatementKind};
    use dbqueue_core::{ConfigError, QueueId};

    fn dao() -> (Arc<RecordingDatabase>, PostgresQueueDao<RecordingDatabase>) {
        let db = Arc::new(RecordingDatabase::new());
        let schema = QueueTableSchema::builder()
            .ext_fields(["trace_id"])
            .build()
            .unwrap();
        (Arc::clone(&db), PostgresQueueDao::new(db, Arc::new(schema)))
    }

    fn location() -> QueueLocation {
        QueueLocation::new("queue_tasks", QueueId::new("mail")).unwrap()
    }

    #[tokio::test]
    async fn enqueue_inserts_and_returns_generated_id() {
        let (db, dao) = dao();
        db.push_rows(vec![MemoryRow::new().with("id", 41i64)]);

        let params = EnqueueParams::new()
            .with_payload("{}")
            .with_execution_delay(Duration::from_secs(5));
        let id = dao.enqueue(&location(), &params).await.unwrap();
        assert_eq!(id, TaskId::new(41));

        let stmt = db.last_statement().unwrap();
        assert_eq!(stmt.kind, StatementKind::SelectOne);
        assert_eq!(
            stmt.sql,
            "INSERT INTO queue_tasks (queue_name, payload, next_process_at, attempt, reenqueue_attempt, total_attempt, trace_id) \
             VALUES (:queueName, :payload, now() + :executionDelay * INTERVAL '1 MILLISECOND', 0, 0, 0, :ext_trace_id) RETURNING id"
        );
        assert_eq!(stmt.params.get("executionDelay"), Some(&SqlValue::BigInt(5_000)));
        assert_eq!(stmt.params.get("ext_trace_id"), Some(&SqlValue::Null));
    }

    #[tokio::test]
    async fn enqueue_with_sequence_uses_nextval_inline() {
        let (db, dao) = dao();
        db.push_rows(vec![MemoryRow::new().with("id", 1i64)]);
        let location = location().with_id_sequence("tasks_seq").unwrap();

        dao.enqueue(&location, &EnqueueParams::new()).await.unwrap();

        let statements = db.statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].sql.starts_with("INSERT INTO queue_tasks (id, queue_name,"));
        assert!(statements[0].sql.contains("VALUES (nextval('tasks_seq'), :queueName,"));
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_ext_before_touching_database() {
        let (db, dao) = dao();
        let params = EnqueueParams::new().with_ext("priority", "high");
        let err = dao.enqueue(&location(), &params).await.unwrap_err();
        assert!(matches!(
            err,
            QueueDaoError::Config(ConfigError::UnknownExtensionColumn(c)) if c == "priority"
        ));
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_went_away() {
        let (db, dao) = dao();
        db.push_affected(1);
        db.push_affected(0);

        assert!(dao.delete_task(&location(), TaskId::new(7)).await.unwrap());
        assert!(!dao.delete_task(&location(), TaskId::new(8)).await.unwrap());

        let stmt = db.last_statement().unwrap();
        assert_eq!(stmt.sql, "DELETE FROM queue_tasks WHERE queue_name = :queueName AND id = :id");
        assert_eq!(stmt.params.get("id"), Some(&SqlValue::BigInt(8)));
    }

    #[tokio::test]
    async fn reenqueue_resets_attempt_and_counts_reenqueue() {
        let (db, dao) = dao();
        db.push_affected(1);

        let moved = dao
            .reenqueue(&location(), TaskId::new(3), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(moved);

        let stmt = db.last_statement().unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE queue_tasks SET next_process_at = now() + :executionDelay * INTERVAL '1 MILLISECOND', \
             attempt = 0, reenqueue_attempt = reenqueue_attempt + 1 WHERE id = :id AND queue_name = :queueName"
        );
        assert!(!stmt.sql.contains("total_attempt"));
        assert_eq!(stmt.params.get("executionDelay"), Some(&SqlValue::BigInt(30_000)));
    }

    #[tokio::test]
    async fn reenqueue_on_missing_task_returns_false() {
        let (_db, dao) = dao();
        let moved = dao
            .reenqueue(&location(), TaskId::new(404), Duration::ZERO)
            .await
            .unwrap();
        assert!(!moved);
    }

    #[tokio::test]
    async fn database_failures_propagate() {
        let (db, dao) = dao();
        db.push_error("duplicate key value violates unique constraint");
        let err = dao.delete_task(&location(), TaskId::new(1)).await.unwrap_err();
        assert!(matches!(err, QueueDaoError::Database(_)));
    }

    #[test]
    fn statement_text_is_cached_per_location() {
        let (_db, dao) = dao();
        let a = dao.enqueue_sql(&location());
        let b = dao.enqueue_sql(&location());
        assert!(Arc::ptr_eq(&a, &b));

        let other = QueueLocation::new("other_tasks", QueueId::new("mail")).unwrap();
        assert!(!Arc::ptr_eq(&a, &dao.enqueue_sql(&other)));
    }
}
