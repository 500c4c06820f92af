//! Supported database dialects.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Database flavour a shard talks to. Selects the SQL strategies of the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum DatabaseDialect {
    Postgresql,
    Mssql,
    /// Oracle 11g: no identity columns, ids come from a sequence.
    Oracle11g,
}

impl DatabaseDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseDialect::Postgresql => "postgresql",
            DatabaseDialect::Mssql => "mssql",
            DatabaseDialect::Oracle11g => "oracle11g",
        }
    }
}

impl core::fmt::Display for DatabaseDialect {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseDialect {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Self::Postgresql),
            "mssql" => Ok(Self::Mssql),
            "oracle11g" => Ok(Self::Oracle11g),
            _ => Err(ConfigError::UnknownDialect(s.to_string())),
        }
    }
}

impl TryFrom<String> for DatabaseDialect {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatabaseDialect> for &'static str {
    fn from(dialect: DatabaseDialect) -> Self {
        dialect.as_str()
    }
}
