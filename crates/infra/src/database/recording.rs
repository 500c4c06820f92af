//! Scripted in-memory execution facade.
//!
//! `RecordingDatabase` runs no SQL. It records every statement with its bound
//! parameters and answers from a queue of scripted responses, which makes it
//! the tool for checking generated SQL and for exercising strategies without a
//! server. It also checks that every `:name` a statement references is bound.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::named::PositionalSql;
use super::r#trait::{
    Database, DatabaseError, OutParam, RowAccessor, RowMapper, RowMappingError, SqlParams,
    SqlValue,
};

/// Facade entry point a statement went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    SelectOne,
    SelectMany,
    Update,
    Call,
}

/// One statement as seen by the facade.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    pub kind: StatementKind,
    pub sql: String,
    pub params: SqlParams,
    pub outputs: Vec<OutParam>,
    pub in_transaction: bool,
}

/// Transaction lifecycle events, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    Begin,
    Join,
    Commit,
    Rollback,
}

/// Answer to the next statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedResponse {
    Rows(Vec<MemoryRow>),
    Affected(u64),
    Error(String),
}

/// A result row held in memory. Column lookup ignores ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryRow(BTreeMap<String, SqlValue>);

impl MemoryRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    fn value(&self, column: &str) -> Result<&SqlValue, RowMappingError> {
        self.0
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
            .ok_or_else(|| RowMappingError::MissingColumn(column.to_string()))
    }
}

fn mismatch(column: &str, expected: &'static str, found: &SqlValue) -> RowMappingError {
    RowMappingError::TypeMismatch {
        column: column.to_string(),
        expected,
        message: format!("found {found:?}"),
    }
}

impl RowAccessor for MemoryRow {
    fn get_opt_i64(&self, column: &str) -> Result<Option<i64>, RowMappingError> {
        match self.value(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::BigInt(v) => Ok(Some(*v)),
            other => Err(mismatch(column, "bigint", other)),
        }
    }

    fn get_opt_string(&self, column: &str) -> Result<Option<String>, RowMappingError> {
        match self.value(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(v) => Ok(Some(v.clone())),
            SqlValue::BigInt(v) => Ok(Some(v.to_string())),
            other => Err(mismatch(column, "text", other)),
        }
    }

    fn get_opt_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, RowMappingError> {
        match self.value(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Timestamp(v) => Ok(Some(*v)),
            other => Err(mismatch(column, "timestamp", other)),
        }
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    statements: Vec<RecordedStatement>,
    responses: VecDeque<ScriptedResponse>,
    transactions: Vec<TransactionEvent>,
    depth: usize,
}

/// `Database` that records statements and replays scripted responses.
///
/// Without a scripted response, queries return no rows, updates affect no
/// rows and calls yield a row whose out-binds are all NULL. Transaction
/// nesting is tracked across all callers of one instance.
#[derive(Debug, Default)]
pub struct RecordingDatabase {
    state: Mutex<RecorderState>,
}

impl RecordingDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next unanswered statement.
    pub fn push_response(&self, response: ScriptedResponse) {
        self.lock().responses.push_back(response);
    }

    pub fn push_rows(&self, rows: Vec<MemoryRow>) {
        self.push_response(ScriptedResponse::Rows(rows));
    }

    pub fn push_affected(&self, count: u64) {
        self.push_response(ScriptedResponse::Affected(count));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.push_response(ScriptedResponse::Error(message.into()));
    }

    pub fn statements(&self) -> Vec<RecordedStatement> {
        self.lock().statements.clone()
    }

    pub fn last_statement(&self) -> Option<RecordedStatement> {
        self.lock().statements.last().cloned()
    }

    pub fn transaction_events(&self) -> Vec<TransactionEvent> {
        self.lock().transactions.clone()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.statements.clear();
        state.responses.clear();
        state.transactions.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(
        &self,
        kind: StatementKind,
        sql: &str,
        params: &SqlParams,
        outputs: &[OutParam],
    ) -> Result<Option<ScriptedResponse>, DatabaseError> {
        for name in PositionalSql::parse(sql).names() {
            if params.get(name).is_none() && !outputs.iter().any(|o| &o.name == name) {
                return Err(DatabaseError::MissingParameter(name.clone()));
            }
        }

        let mut state = self.lock();
        let in_transaction = state.depth > 0;
        state.statements.push(RecordedStatement {
            kind,
            sql: sql.to_string(),
            params: params.clone(),
            outputs: outputs.to_vec(),
            in_transaction,
        });
        match state.responses.pop_front() {
            Some(ScriptedResponse::Error(message)) => Err(DatabaseError::Backend(message)),
            other => Ok(other),
        }
    }

    fn rows_for(
        &self,
        kind: StatementKind,
        sql: &str,
        params: &SqlParams,
    ) -> Result<Vec<MemoryRow>, DatabaseError> {
        match self.record(kind, sql, params, &[])? {
            None => Ok(Vec::new()),
            Some(ScriptedResponse::Rows(rows)) => Ok(rows),
            Some(other) => Err(unexpected(kind, &other)),
        }
    }
}

fn unexpected(kind: StatementKind, response: &ScriptedResponse) -> DatabaseError {
    DatabaseError::Backend(format!(
        "scripted response {response:?} does not fit a {kind:?} statement"
    ))
}

#[async_trait]
impl Database for RecordingDatabase {
    async fn select_one<T: Send + 'static>(
        &self,
        sql: &str,
        params: &SqlParams,
        mapper: RowMapper<'_, T>,
    ) -> Result<Option<T>, DatabaseError> {
        let rows = self.rows_for(StatementKind::SelectOne, sql, params)?;
        match rows.first() {
            Some(row) => Ok(Some(mapper(row as &dyn RowAccessor)?)),
            None => Ok(None),
        }
    }

    async fn select_many<T: Send + 'static>(
        &self,
        sql: &str,
        params: &SqlParams,
        mapper: RowMapper<'_, T>,
    ) -> Result<Vec<T>, DatabaseError> {
        let rows = self.rows_for(StatementKind::SelectMany, sql, params)?;
        let mut mapped = Vec::with_capacity(rows.len());
        for row in &rows {
            mapped.push(mapper(row as &dyn RowAccessor)?);
        }
        Ok(mapped)
    }

    async fn update(&self, sql: &str, params: &SqlParams) -> Result<u64, DatabaseError> {
        match self.record(StatementKind::Update, sql, params, &[])? {
            None => Ok(0),
            Some(ScriptedResponse::Affected(count)) => Ok(count),
            Some(other) => Err(unexpected(StatementKind::Update, &other)),
        }
    }

    async fn call<T: Send + 'static>(
        &self,
        sql: &str,
        params: &SqlParams,
        outputs: &[OutParam],
        mapper: RowMapper<'_, T>,
    ) -> Result<T, DatabaseError> {
        let row = match self.record(StatementKind::Call, sql, params, outputs)? {
            None => outputs
                .iter()
                .fold(MemoryRow::new(), |row, o| row.with(o.name.clone(), SqlValue::Null)),
            Some(ScriptedResponse::Rows(mut rows)) if rows.len() == 1 => rows.remove(0),
            Some(other) => return Err(unexpected(StatementKind::Call, &other)),
        };
        Ok(mapper(&row as &dyn RowAccessor)?)
    }

    async fn run_in_transaction<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        T: Send,
        E: From<DatabaseError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        {
            let mut state = self.lock();
            let event = if state.depth == 0 {
                TransactionEvent::Begin
            } else {
                TransactionEvent::Join
            };
            state.transactions.push(event);
            state.depth += 1;
        }

        let outcome = work().await;

        let mut state = self.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            let event = if outcome.is_ok() {
                TransactionEvent::Commit
            } else {
                TransactionEvent::Rollback
            };
            state.transactions.push(event);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqlType;

    fn id_mapper(row: &dyn RowAccessor) -> Result<i64, RowMappingError> {
        row.get_i64("id")
    }

    #[tokio::test]
    async fn records_statements_and_replays_rows() {
        let db = RecordingDatabase::new();
        db.push_rows(vec![MemoryRow::new().with("ID", 7i64)]);

        let params = SqlParams::new().with("queueName", "mail");
        let id = db
            .select_one("SELECT id FROM t WHERE queue_name = :queueName", &params, &id_mapper)
            .await
            .unwrap();
        assert_eq!(id, Some(7));

        let recorded = db.last_statement().unwrap();
        assert_eq!(recorded.kind, StatementKind::SelectOne);
        assert_eq!(recorded.params, params);
        assert!(!recorded.in_transaction);
    }

    #[tokio::test]
    async fn unbound_placeholder_is_rejected() {
        let db = RecordingDatabase::new();
        let err = db
            .update("DELETE FROM t WHERE id = :id", &SqlParams::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::MissingParameter(name) if name == "id"));
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn defaults_without_script() {
        let db = RecordingDatabase::new();
        assert_eq!(db.update("DELETE FROM t", &SqlParams::new()).await.unwrap(), 0);
        let none = db.select_one("SELECT id FROM t", &SqlParams::new(), &id_mapper).await.unwrap();
        assert_eq!(none, None);

        let outputs = [OutParam::new("id", SqlType::BigInt)];
        let id = db
            .call(
                "BEGIN :id := 1; END;",
                &SqlParams::new(),
                &outputs,
                &|row: &dyn RowAccessor| row.get_opt_i64("id"),
            )
            .await
            .unwrap();
        assert_eq!(id, None);
    }

    #[tokio::test]
    async fn scripted_error_and_mismatch() {
        let db = RecordingDatabase::new();
        db.push_error("connection reset");
        db.push_rows(vec![]);
        assert!(matches!(
            db.update("DELETE FROM t", &SqlParams::new()).await,
            Err(DatabaseError::Backend(msg)) if msg == "connection reset"
        ));
        assert!(matches!(
            db.update("DELETE FROM t", &SqlParams::new()).await,
            Err(DatabaseError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn nested_transactions_join_and_roll_back_once() {
        let db = RecordingDatabase::new();
        let result: Result<(), DatabaseError> = db
            .run_in_transaction(|| async {
                db.update("UPDATE t SET a = 1", &SqlParams::new()).await?;
                db.run_in_transaction(|| async {
                    Err::<(), _>(DatabaseError::Backend("inner failure".into()))
                })
                .await
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            db.transaction_events(),
            [TransactionEvent::Begin, TransactionEvent::Join, TransactionEvent::Rollback]
        );
        assert!(db.statements()[0].in_transaction);
    }

    #[test]
    fn memory_row_type_checks() {
        let row = MemoryRow::new()
            .with("n", 1i64)
            .with("s", "x")
            .with("z", SqlValue::Null);
        assert_eq!(row.get_opt_string("n").unwrap(), Some("1".to_string()));
        assert!(matches!(row.get_i64("s"), Err(RowMappingError::TypeMismatch { .. })));
        assert!(matches!(row.get_i64("z"), Err(RowMappingError::UnexpectedNull(_))));
        assert!(matches!(row.get_opt_i64("q"), Err(RowMappingError::MissingColumn(_))));
    }
}
