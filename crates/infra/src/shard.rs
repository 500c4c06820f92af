//! Queue shard: one database, one dialect, one table schema.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use dbqueue_core::{DatabaseDialect, QueueShardId, QueueTableSchema};

use crate::config::QueueShardConfig;
use crate::dao::{QueueDao, QueuePickTaskDao, queue_dao};
use crate::database::{Database, DatabaseError};
use crate::pick::pick_task_dao;

/// Binds a database to the queue strategies of its dialect.
///
/// The strategies are chosen once, at construction, and never change. The
/// database is shared with whoever built the shard.
pub struct QueueShard<D> {
    shard_id: QueueShardId,
    dialect: DatabaseDialect,
    schema: Arc<QueueTableSchema>,
    database: Arc<D>,
    queue_dao: Box<dyn QueueDao>,
    pick_task_dao: Box<dyn QueuePickTaskDao>,
}

impl<D: Database> QueueShard<D> {
    pub fn new(
        dialect: DatabaseDialect,
        schema: QueueTableSchema,
        shard_id: QueueShardId,
        database: Arc<D>,
    ) -> Self {
        let schema = Arc::new(schema);
        let queue_dao = queue_dao(dialect, Arc::clone(&schema), Arc::clone(&database));
        let pick_task_dao = pick_task_dao(dialect, Arc::clone(&schema), Arc::clone(&database));
        info!(
            shard_id = %shard_id,
            dialect = %dialect,
            ext_fields = schema.ext_fields().len(),
            "queue shard ready"
        );
        Self {
            shard_id,
            dialect,
            schema,
            database,
            queue_dao,
            pick_task_dao,
        }
    }

    pub fn from_config(config: &QueueShardConfig, database: Arc<D>) -> Self {
        Self::new(
            config.dialect,
            config.schema.clone(),
            config.shard_id.clone(),
            database,
        )
    }

    pub fn shard_id(&self) -> &QueueShardId {
        &self.shard_id
    }

    pub fn database_dialect(&self) -> DatabaseDialect {
        self.dialect
    }

    pub fn queue_table_schema(&self) -> &QueueTableSchema {
        &self.schema
    }

    pub fn database(&self) -> &Arc<D> {
        &self.database
    }

    /// Enqueue, delete and reenqueue for this shard's dialect.
    pub fn queue_dao(&self) -> &dyn QueueDao {
        self.queue_dao.as_ref()
    }

    /// Task claim for this shard's dialect.
    pub fn pick_task_dao(&self) -> &dyn QueuePickTaskDao {
        self.pick_task_dao.as_ref()
    }

    /// Run `work` in a transaction of the shard's database.
    ///
    /// Every queue operation `work` issues through this shard on the current
    /// task takes part in it.
    pub async fn run_in_transaction<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        T: Send,
        E: From<DatabaseError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.database.run_in_transaction(work).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use dbqueue_core::{EnqueueParams, PickTaskSettings, QueueId, QueueLocation, TaskId};

    use crate::dao::QueueDaoError;
    use crate::database::{MemoryRow, RecordingDatabase, TransactionEvent};

    fn shard(dialect: DatabaseDialect) -> (Arc<RecordingDatabase>, QueueShard<RecordingDatabase>) {
        let db = Arc::new(RecordingDatabase::new());
        let shard = QueueShard::new(
            dialect,
            QueueTableSchema::default(),
            QueueShardId::new("main"),
            Arc::clone(&db),
        );
        (db, shard)
    }

    fn location() -> QueueLocation {
        QueueLocation::new("queue_tasks", QueueId::new("mail")).unwrap()
    }

    #[test]
    fn strategies_follow_the_dialect() {
        for dialect in [DatabaseDialect::Postgresql, DatabaseDialect::Mssql, DatabaseDialect::Oracle11g] {
            let (_db, shard) = shard(dialect);
            assert_eq!(shard.database_dialect(), dialect);
            assert_eq!(shard.queue_dao().dialect(), dialect);
            assert_eq!(shard.pick_task_dao().dialect(), dialect);
            assert_eq!(shard.shard_id().as_str(), "main");
            assert_eq!(shard.queue_table_schema(), &QueueTableSchema::default());
        }
    }

    #[test]
    fn built_from_config() {
        let config = QueueShardConfig::new(
            QueueShardId::new("s2"),
            DatabaseDialect::Mssql,
            QueueTableSchema::builder().ext_field("tenant").build().unwrap(),
        );
        let db = Arc::new(RecordingDatabase::new());
        let shard = QueueShard::from_config(&config, Arc::clone(&db));
        assert_eq!(shard.shard_id(), &config.shard_id);
        assert!(shard.queue_table_schema().has_ext_field("tenant"));
        assert!(Arc::ptr_eq(shard.database(), &db));
    }

    #[tokio::test]
    async fn operations_inside_run_in_transaction_join_it() {
        let (db, shard) = shard(DatabaseDialect::Postgresql);
        db.push_rows(vec![MemoryRow::new().with("id", 1i64)]);
        db.push_affected(1);

        let location = location();
        let deleted = shard
            .run_in_transaction(|| async {
                let id = shard
                    .queue_dao()
                    .enqueue(&location, &EnqueueParams::new().with_payload("{}"))
                    .await?;
                shard.queue_dao().delete_task(&location, id).await
            })
            .await
            .unwrap();
        assert!(deleted);
        assert!(db.statements().iter().all(|s| s.in_transaction));
        assert_eq!(
            db.transaction_events(),
            [TransactionEvent::Begin, TransactionEvent::Commit]
        );
    }

    #[tokio::test]
    async fn failed_work_rolls_back() {
        let (db, shard) = shard(DatabaseDialect::Mssql);
        db.push_error("deadlock victim");

        let location = location();
        let result: Result<bool, QueueDaoError> = shard
            .run_in_transaction(|| async {
                shard
                    .queue_dao()
                    .reenqueue(&location, TaskId::new(4), Duration::from_secs(1))
                    .await
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            db.transaction_events(),
            [TransactionEvent::Begin, TransactionEvent::Rollback]
        );
    }

    #[tokio::test]
    async fn oracle_shard_requires_sequence_on_enqueue() {
        let (db, shard) = shard(DatabaseDialect::Oracle11g);
        let err = shard
            .queue_dao()
            .enqueue(&location(), &EnqueueParams::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueDaoError::Config(_)));
        assert!(db.statements().is_empty());

        let claimed = shard
            .pick_task_dao()
            .pick_task(&location(), &PickTaskSettings::default())
            .await
            .unwrap();
        assert!(claimed.is_none());
    }
}
