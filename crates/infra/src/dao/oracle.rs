//! Oracle 11g queue strategy.
//!
//! Oracle 11g has no identity columns, so every location must name a sequence.
//! Enqueue draws the next value with a separate query and inserts it as an
//! explicit id. A failed insert leaves the drawn value unused; ids have gaps.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{Span, debug, instrument};

use dbqueue_core::{
    ConfigError, DatabaseDialect, EnqueueParams, QueueLocation, QueueTableSchema, TaskId,
};

use super::params::{DeleteArgs, EnqueueArgs, ID, OracleEnqueueArgs, ReenqueueArgs};
use super::r#trait::{QueueDao, QueueDaoError};
use super::{execution_delay_param, insert_lists, render_delete, render_reenqueue};
use crate::database::{Database, DatabaseError, RowAccessor, RowMappingError, SqlParams};
use crate::sql_cache::SqlCache;

const NEXT_ID_COLUMN: &str = "next_id";

fn delayed_now() -> String {
    format!(
        "CURRENT_TIMESTAMP + NUMTODSINTERVAL({} / 1000, 'SECOND')",
        execution_delay_param()
    )
}

pub struct Oracle11QueueDao<D> {
    database: Arc<D>,
    schema: Arc<QueueTableSchema>,
    next_id_sql: SqlCache<String>,
    enqueue_sql: SqlCache<QueueLocation>,
    delete_sql: SqlCache<QueueLocation>,
    reenqueue_sql: SqlCache<QueueLocation>,
}

impl<D: Database> Oracle11QueueDao<D> {
    pub fn new(database: Arc<D>, schema: Arc<QueueTableSchema>) -> Self {
        Self {
            database,
            schema,
            next_id_sql: SqlCache::new(),
            enqueue_sql: SqlCache::new(),
            delete_sql: SqlCache::new(),
            reenqueue_sql: SqlCache::new(),
        }
    }

    fn id_sequence<'a>(&self, location: &'a QueueLocation) -> Result<&'a str, ConfigError> {
        location.id_sequence().ok_or_else(|| {
            ConfigError::missing_id_sequence(DatabaseDialect::Oracle11g.as_str(), location.table_name())
        })
    }

    pub fn next_id_sql(&self, sequence: &str) -> Arc<str> {
        let Ok(sql) = self.next_id_sql.get_or_try_insert(sequence, || {
            Ok::<_, Infallible>(Arc::from(format!(
                "SELECT {sequence}.nextval AS {NEXT_ID_COLUMN} FROM dual"
            )))
        });
        sql
    }

    pub fn enqueue_sql(&self, location: &QueueLocation) -> Result<Arc<str>, ConfigError> {
        self.id_sequence(location)?;
        let Ok(sql) = self.enqueue_sql.get_or_try_insert(location, || {
            let id_value = format!(":{ID}");
            let (columns, values) = insert_lists(&self.schema, Some(&id_value), &delayed_now());
            let sql = format!(
                "INSERT INTO {table} ({columns}) VALUES ({values})",
                table = location.table_name(),
            );
            debug!(%location, %sql, "rendered oracle enqueue");
            Ok::<_, Infallible>(Arc::from(sql))
        });
        Ok(sql)
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
            debug!(%location, %sql, "rendered oracle reenqueue");
            Ok::<_, Infallible>(Arc::from(sql))
        });
        sql
    }

    async fn next_id(&self, sequence: &str) -> Result<TaskId, QueueDaoError> {
        let sql = self.next_id_sql(sequence);
        let mapper = |row: &dyn RowAccessor| -> Result<TaskId, RowMappingError> {
            row.get_i64(NEXT_ID_COLUMN).map(TaskId::new)
        };
        let id = self
            .database
            .select_one(&sql, &SqlParams::new(), &mapper)
            .await?
            .ok_or_else(|| DatabaseError::Backend(format!("sequence {sequence} returned no value")))?;
        Ok(id)
    }
}

#[async_trait]
impl<D: Database> QueueDao for Oracle11QueueDao<D> {
    fn dialect(&self) -> DatabaseDialect {
        DatabaseDialect::Oracle11g
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
        let sequence = self.id_sequence(location)?;
        let enqueue = EnqueueArgs::new(&self.schema, location, params)?;
        let sql = self.enqueue_sql(location)?;

        let id = self.next_id(sequence).await?;
        Span::current().record("task_id", id.value());

        let args = OracleEnqueueArgs { id, enqueue };
        self.database.update(&sql, &args.to_params()).await?;
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
