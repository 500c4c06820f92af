//! PostgreSQL execution facade over a `sqlx` pool.
//!
//! Statements arrive with `:name` placeholders and are rewritten to `$n` once
//! per distinct text. While [`Database::run_in_transaction`] runs, the open
//! transaction is stored in a task-local map keyed by facade instance, and
//! every statement issued by that facade on the same task runs on it.
//!
//! ## Error Mapping
//!
//! Every driver failure becomes `DatabaseError::Sqlx` tagged with the facade
//! operation (`select_one`, `select_many`, `update`, `begin`, `commit`).
//! Nothing is retried or translated; callers inspect
//! [`DatabaseError::database_code`] for the SQLSTATE.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::named::PositionalSql;
use super::r#trait::{
    Database, DatabaseError, OutParam, RowAccessor, RowMapper, RowMappingError, SqlParams,
    SqlValue,
};
use crate::sql_cache::SqlCache;

type SharedTransaction = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

#[derive(Clone, Default)]
struct ActiveTransactions(HashMap<u64, SharedTransaction>);

tokio::task_local! {
    static ACTIVE_TRANSACTIONS: ActiveTransactions;
}

static NEXT_FACADE_ID: AtomicU64 = AtomicU64::new(1);

/// `Database` implementation for PostgreSQL.
///
/// Cloning is cheap and clones share the pool, the statement cache and the
/// transaction identity.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    id: u64,
    pool: PgPool,
    statements: Arc<SqlCache<String, Arc<PositionalSql>>>,
}

impl PgDatabase {
    /// Create a facade over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            id: NEXT_FACADE_ID.fetch_add(1, Ordering::Relaxed),
            pool,
            statements: Arc::new(SqlCache::new()),
        }
    }

    /// Connect a default pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether the current task is inside a transaction of this facade.
    pub fn in_transaction(&self) -> bool {
        self.active_transaction().is_some()
    }

    fn active_transaction(&self) -> Option<SharedTransaction> {
        ACTIVE_TRANSACTIONS
            .try_with(|active| active.0.get(&self.id).cloned())
            .ok()
            .flatten()
    }

    fn prepare(&self, sql: &str) -> Arc<PositionalSql> {
        let Ok(statement) = self
            .statements
            .get_or_try_insert(sql, || Ok::<_, Infallible>(Arc::new(PositionalSql::parse(sql))));
        statement
    }

    async fn fetch_rows(
        &self,
        operation: &'static str,
        sql: &str,
        params: &SqlParams,
    ) -> Result<Vec<PgRow>, DatabaseError> {
        let statement = self.prepare(sql);
        let query = bind_values(sqlx::query(statement.sql()), statement.values(params)?);

        let rows = match self.active_transaction() {
            Some(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or_else(transaction_completed)?;
                query.fetch_all(&mut **tx).await
            }
            None => query.fetch_all(&self.pool).await,
        };
        rows.map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait]
impl Database for PgDatabase {
    #[instrument(skip(self, params, mapper), fields(db.system = "postgresql"), err)]
    async fn select_one<T: Send + 'static>(
        &self,
        sql: &str,
        params: &SqlParams,
        mapper: RowMapper<'_, T>,
    ) -> Result<Option<T>, DatabaseError> {
        let rows = self.fetch_rows("select_one", sql, params).await?;
        match rows.first() {
            Some(row) => Ok(Some(mapper(row as &dyn RowAccessor)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, params, mapper), fields(db.system = "postgresql"), err)]
    async fn select_many<T: Send + 'static>(
        &self,
        sql: &str,
        params: &SqlParams,
        mapper: RowMapper<'_, T>,
    ) -> Result<Vec<T>, DatabaseError> {
        let rows = self.fetch_rows("select_many", sql, params).await?;
        let mut mapped = Vec::with_capacity(rows.len());
        for row in &rows {
            mapped.push(mapper(row as &dyn RowAccessor)?);
        }
        Ok(mapped)
    }

    #[instrument(skip(self, params), fields(db.system = "postgresql"), err)]
    async fn update(&self, sql: &str, params: &SqlParams) -> Result<u64, DatabaseError> {
        let statement = self.prepare(sql);
        let query = bind_values(sqlx::query(statement.sql()), statement.values(params)?);

        let result = match self.active_transaction() {
            Some(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or_else(transaction_completed)?;
                query.execute(&mut **tx).await
            }
            None => query.execute(&self.pool).await,
        };
        Ok(result.map_err(|e| map_sqlx_error("update", e))?.rows_affected())
    }

    async fn call<T: Send + 'static>(
        &self,
        _sql: &str,
        _params: &SqlParams,
        _outputs: &[OutParam],
        _mapper: RowMapper<'_, T>,
    ) -> Result<T, DatabaseError> {
        Err(DatabaseError::Unsupported(
            "anonymous blocks with out-binds are not available on postgresql".to_string(),
        ))
    }

    async fn run_in_transaction<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        T: Send,
        E: From<DatabaseError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        if self.in_transaction() {
            return work().await;
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let shared: SharedTransaction = Arc::new(Mutex::new(Some(tx)));
        let mut active = ACTIVE_TRANSACTIONS
            .try_with(Clone::clone)
            .unwrap_or_default();
        active.0.insert(self.id, Arc::clone(&shared));

        let outcome = ACTIVE_TRANSACTIONS.scope(active, work()).await;

        let tx = shared.lock().await.take().ok_or_else(transaction_completed)?;
        match outcome {
            Ok(value) => {
                tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
                debug!(facade_id = self.id, "transaction committed");
                Ok(value)
            }
            Err(err) => {
                match tx.rollback().await {
                    Ok(()) => debug!(facade_id = self.id, "transaction rolled back"),
                    Err(rollback_err) => {
                        warn!(facade_id = self.id, error = %rollback_err, "rollback failed")
                    }
                }
                Err(err)
            }
        }
    }
}

fn bind_values<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    values: Vec<&SqlValue>,
) -> Query<'q, Postgres, PgArguments> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::BigInt(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Timestamp(v) => query.bind(*v),
        };
    }
    query
}

fn transaction_completed() -> DatabaseError {
    DatabaseError::Transaction("transaction already completed".to_string())
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> DatabaseError {
    if let sqlx::Error::Database(db_err) = &err {
        debug!(
            operation,
            code = db_err.code().as_deref().unwrap_or(""),
            "database rejected statement"
        );
    }
    DatabaseError::sqlx(operation, err)
}

fn column_index(row: &PgRow, column: &str) -> Result<usize, RowMappingError> {
    row.columns()
        .iter()
        .position(|c| c.name().eq_ignore_ascii_case(column))
        .ok_or_else(|| RowMappingError::MissingColumn(column.to_string()))
}

fn mismatch(column: &str, expected: &'static str, err: sqlx::Error) -> RowMappingError {
    RowMappingError::TypeMismatch {
        column: column.to_string(),
        expected,
        message: err.to_string(),
    }
}

impl RowAccessor for PgRow {
    fn get_opt_i64(&self, column: &str) -> Result<Option<i64>, RowMappingError> {
        let idx = column_index(self, column)?;
        match self.try_get::<Option<i64>, _>(idx) {
            Ok(v) => Ok(v),
            Err(_) => self
                .try_get::<Option<i32>, _>(idx)
                .map(|v| v.map(i64::from))
                .map_err(|e| mismatch(column, "bigint", e)),
        }
    }

    fn get_opt_string(&self, column: &str) -> Result<Option<String>, RowMappingError> {
        let idx = column_index(self, column)?;
        self.try_get::<Option<String>, _>(idx)
            .map_err(|e| mismatch(column, "text", e))
    }

    fn get_opt_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, RowMappingError> {
        let idx = column_index(self, column)?;
        match self.try_get::<Option<DateTime<Utc>>, _>(idx) {
            Ok(v) => Ok(v),
            Err(_) => self
                .try_get::<Option<NaiveDateTime>, _>(idx)
                .map(|v| v.map(|naive| naive.and_utc()))
                .map_err(|e| mismatch(column, "timestamp", e)),
        }
    }
}
