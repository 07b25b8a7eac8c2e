//! Transaction isolation levels.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Isolation level requested for a step's transaction.
///
/// Steps that don't set one run at the store's default level.
///
/// ```
/// use ironstep::IsolationLevel;
///
/// assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
/// assert_eq!(
///     IsolationLevel::begin_statement(Some(IsolationLevel::Serializable)),
///     "BEGIN ISOLATION LEVEL SERIALIZABLE"
/// );
/// assert_eq!(IsolationLevel::begin_statement(None), "BEGIN");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    Serializable,
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
}

impl IsolationLevel {
    /// The level as it appears in SQL.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Serializable => "SERIALIZABLE",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::ReadCommitted => "READ COMMITTED",
            Self::ReadUncommitted => "READ UNCOMMITTED",
        }
    }

    /// The `ISOLATION LEVEL ...` clause, or nothing for the store default.
    pub fn clause(level: Option<Self>) -> Option<String> {
        level.map(|level| format!("ISOLATION LEVEL {}", level.as_sql()))
    }

    /// The statement that opens a transaction at `level`.
    pub fn begin_statement(level: Option<Self>) -> String {
        match Self::clause(level) {
            Some(clause) => format!("BEGIN {clause}"),
            None => "BEGIN".to_owned(),
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    /// Accepts the SQL spelling and the snake/camel case config spellings,
    /// case-insensitively.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "serializable" => Ok(Self::Serializable),
            "repeatableread" => Ok(Self::RepeatableRead),
            "readcommitted" => Ok(Self::ReadCommitted),
            "readuncommitted" => Ok(Self::ReadUncommitted),
            _ => Err(Error::InvalidIsolationLevel(value.to_owned())),
        }
    }
}
