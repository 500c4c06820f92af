use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A value bound to a named statement parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    BigInt(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::BigInt(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

/// Named parameters of one statement, keyed without the leading `:`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlParams(BTreeMap<String, SqlValue>);

impl SqlParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.0.get(name)
    }

    /// Look up a parameter the statement references, failing if it was never bound.
    pub fn require(&self, name: &str) -> Result<&SqlValue, DatabaseError> {
        self.get(name)
            .ok_or_else(|| DatabaseError::MissingParameter(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// SQL type of an out-bind of a callable block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    BigInt,
    Text,
    Timestamp,
}

/// Named output parameter of a callable block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutParam {
    pub name: String,
    pub kind: SqlType,
}

impl OutParam {
    pub fn new(name: impl Into<String>, kind: SqlType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Typed, by-name access to one result row.
///
/// Implemented by every backend row type so that row mappers stay pure and
/// backend-agnostic.
pub trait RowAccessor {
    fn get_opt_i64(&self, column: &str) -> Result<Option<i64>, RowMappingError>;

    fn get_opt_string(&self, column: &str) -> Result<Option<String>, RowMappingError>;

    fn get_opt_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, RowMappingError>;

    fn get_i64(&self, column: &str) -> Result<i64, RowMappingError> {
        self.get_opt_i64(column)?
            .ok_or_else(|| RowMappingError::UnexpectedNull(column.to_string()))
    }

    fn get_timestamp(&self, column: &str) -> Result<DateTime<Utc>, RowMappingError> {
        self.get_opt_timestamp(column)?
            .ok_or_else(|| RowMappingError::UnexpectedNull(column.to_string()))
    }
}

/// Pure function from a row to a value.
pub type RowMapper<'a, T> =
    &'a (dyn Fn(&dyn RowAccessor) -> Result<T, RowMappingError> + Send + Sync);

/// A row could not be turned into a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RowMappingError {
    #[error("column not found in result row: {0}")]
    MissingColumn(String),

    #[error("column {column} is not a {expected}: {message}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        message: String,
    },

    #[error("column {0} is unexpectedly null")]
    UnexpectedNull(String),

    #[error("column {column} holds a negative counter: {value}")]
    NegativeCounter { column: String, value: i64 },
}

/// Failure reported by an execution facade.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Error returned by the sqlx driver, tagged with the facade operation.
    #[error("sqlx error in {operation}: {source}")]
    Sqlx {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to map result row: {0}")]
    RowMapping(#[from] RowMappingError),

    #[error("statement references unbound parameter :{0}")]
    MissingParameter(String),

    #[error("operation not supported by this database: {0}")]
    Unsupported(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    /// Failure of a facade that is not backed by sqlx.
    #[error("database error: {0}")]
    Backend(String),
}

impl DatabaseError {
    pub fn sqlx(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Sqlx { operation, source }
    }

    /// SQLSTATE or vendor code of a driver-side database error, if any.
    pub fn database_code(&self) -> Option<String> {
        match self {
            DatabaseError::Sqlx {
                source: sqlx::Error::Database(db_err),
                ..
            } => db_err.code().map(|c| c.into_owned()),
            _ => None,
        }
    }
}

/// Execution facade over one physical database.
///
/// Statements use `:name` placeholders and receive their values through
/// [`SqlParams`]. Every call made while [`Database::run_in_transaction`] is
/// running on the current task joins that transaction.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Run a query expected to return at most one row.
    async fn select_one<T: Send + 'static>(
        &self,
        sql: &str,
        params: &SqlParams,
        mapper: RowMapper<'_, T>,
    ) -> Result<Option<T>, DatabaseError>;

    /// Run a query and map every returned row.
    async fn select_many<T: Send + 'static>(
        &self,
        sql: &str,
        params: &SqlParams,
        mapper: RowMapper<'_, T>,
    ) -> Result<Vec<T>, DatabaseError>;

    /// Run an insert, update or delete and return the affected row count.
    async fn update(&self, sql: &str, params: &SqlParams) -> Result<u64, DatabaseError>;

    /// Run an anonymous block and read its out-binds as one row.
    ///
    /// Out-binds appear in the block text as `:name` placeholders; `outputs`
    /// declares their names and types.
    async fn call<T: Send + 'static>(
        &self,
        sql: &str,
        params: &SqlParams,
        outputs: &[OutParam],
        mapper: RowMapper<'_, T>,
    ) -> Result<T, DatabaseError>;

    /// Run `work` in a read committed transaction.
    ///
    /// Commits when `work` returns `Ok`, rolls back on `Err`. A nested call
    /// on the same task joins the outer transaction and leaves completion to it.
    async fn run_in_transaction<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        T: Send,
        E: From<DatabaseError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send;
}

#[async_trait]
impl<D: Database> Database for std::sync::Arc<D> {
    async fn select_one<T: Send + 'static>(
        &self,
        sql: &str,
        params: &SqlParams,
        mapper: RowMapper<'_, T>,
    ) -> Result<Option<T>, DatabaseError> {
        (**self).select_one(sql, params, mapper).await
    }

    async fn select_many<T: Send + 'static>(
        &self,
        sql: &str,
        params: &SqlParams,
        mapper: RowMapper<'_, T>,
    ) -> Result<Vec<T>, DatabaseError> {
        (**self).select_many(sql, params, mapper).await
    }

    async fn update(&self, sql: &str, params: &SqlParams) -> Result<u64, DatabaseError> {
        (**self).update(sql, params).await
    }

    async fn call<T: Send + 'static>(
        &self,
        sql: &str,
        params: &SqlParams,
        outputs: &[OutParam],
        mapper: RowMapper<'_, T>,
    ) -> Result<T, DatabaseError> {
        (**self).call(sql, params, outputs, mapper).await
    }

    async fn run_in_transaction<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        T: Send,
        E: From<DatabaseError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        (**self).run_in_transaction(work).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_values_map_to_null() {
        assert_eq!(SqlValue::from(None::<String>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(5i64)), SqlValue::BigInt(5));
        assert_eq!(SqlValue::from("x"), SqlValue::Text("x".into()));
    }

    #[test]
    fn require_reports_missing_parameter() {
        let params = SqlParams::new().with("queueName", "mail");
        assert_eq!(params.require("queueName").unwrap(), &SqlValue::Text("mail".into()));
        assert!(matches!(
            params.require("id"),
            Err(DatabaseError::MissingParameter(name)) if name == "id"
        ));
    }
}
