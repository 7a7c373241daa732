//! Database error types.

use haven_core::ErrorKind;
use thiserror::Error;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQL execution error
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Connection pool error
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Entity not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// State precondition violated
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Input malformed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection timeout
    #[error("Connection timeout")]
    Timeout,
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    /// Broad failure category for retry and reporting decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::NotFound(_) => ErrorKind::NotFound,
            DbError::Conflict(_) => ErrorKind::Conflict,
            DbError::Validation(_) => ErrorKind::Validation,
            DbError::Sql(err) if err.as_database_error().is_none() => ErrorKind::Transient,
            DbError::Pool(_) | DbError::Timeout => ErrorKind::Transient,
            _ => ErrorKind::Storage,
        }
    }

    /// Check if error is a not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(DbError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(DbError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(DbError::Timeout.kind(), ErrorKind::Transient);
        assert_eq!(
            DbError::Migration("x".into()).kind(),
            ErrorKind::Storage
        );
    }

    #[test]
    fn test_retryable() {
        assert!(DbError::Pool("down".into()).is_retryable());
        assert!(!DbError::Validation("bad".into()).is_retryable());
    }
}
