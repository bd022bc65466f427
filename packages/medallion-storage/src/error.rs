//! Error types for medallion-storage

use std::fmt;
use thiserror::Error;

/// What went wrong in the warehouse or the run ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// SQLite failure
    Database,
    /// Stored value that no longer decodes (timestamps, enum labels)
    Serialization,
    /// No staging or model table under that name
    TableNotFound,
    RunNotFound,
    /// Lock or write transaction ended in an impossible state
    Transaction,
    /// Rows that do not fit the declared table shape
    Schema,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::TableNotFound => "table_not_found",
            ErrorKind::RunNotFound => "run_not_found",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Schema => "schema",
        }
    }

    /// Lookup misses, as opposed to broken storage
    pub fn is_not_found(&self) -> bool {
        matches!(self, ErrorKind::TableNotFound | ErrorKind::RunNotFound)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    /// `table` is the qualified name, e.g. `gold.churn_summary`
    pub fn table_not_found(table: impl fmt::Display) -> Self {
        Self::new(ErrorKind::TableNotFound, format!("No such table: {}", table))
    }

    pub fn run_not_found(run_id: impl fmt::Display) -> Self {
        Self::new(ErrorKind::RunNotFound, format!("No run recorded as {}", run_id))
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Schema, message)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::new(ErrorKind::Database, format!("SQLite error: {}", err)).with_source(err)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display_carries_kind_and_table() {
        let err = StorageError::table_not_found("gold.churn_summary");
        assert_eq!(err.to_string(), "[table_not_found] No such table: gold.churn_summary");
        assert!(err.kind.is_not_found());
    }

    #[test]
    fn test_lock_transaction_error_is_not_a_miss() {
        let err = StorageError::transaction("Lock row vanished");
        assert_eq!(err.kind, ErrorKind::Transaction);
        assert!(!err.kind.is_not_found());
        assert!(err.source().is_none());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_sqlite_error_keeps_source() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();

        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.message.starts_with("SQLite error"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_missing_run_propagates() {
        fn lookup() -> Result<()> {
            Err(StorageError::run_not_found("5f1c"))
        }

        fn history() -> Result<usize> {
            lookup()?;
            Ok(1)
        }

        let err = history().unwrap_err();
        assert_eq!(err.kind, ErrorKind::RunNotFound);
        assert!(err.message.contains("5f1c"));
    }
}
