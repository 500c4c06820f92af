//! SQL execution facade.
//!
//! Queue strategies render named-parameter SQL and hand it to a [`Database`]
//! together with a row mapper. The facade owns binding, row access and
//! transaction propagation.

pub mod named;
pub mod postgres;
#[cfg(any(test, feature = "testing"))]
pub mod recording;
pub mod r#trait;

pub use postgres::PgDatabase;
#[cfg(any(test, feature = "testing"))]
pub use recording::{
    MemoryRow, RecordedStatement, RecordingDatabase, ScriptedResponse, StatementKind,
    TransactionEvent,
};
pub use r#trait::{
    Database, DatabaseError, OutParam, RowAccessor, RowMapper, RowMappingError, SqlParams,
    SqlType, SqlValue,
};
