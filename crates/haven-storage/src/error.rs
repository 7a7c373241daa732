//! Storage engine error types.

use haven_core::ErrorKind;
use thiserror::Error;

/// Errors from repositories, engines and workers.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backup not found
    #[error("backup not found: {0}")]
    BackupNotFound(String),

    /// Repository not found
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// Incremental create without a parent
    #[error("parent backup required for incremental backup")]
    ParentBackupRequired,

    /// Backup type not supported by this operation
    #[error("invalid backup type: {0}")]
    InvalidBackupType(String),

    /// Deleting a backup that incrementals still depend on
    #[error("backup {0} has dependent incrementals")]
    HasDependents(String),

    /// Repository still referenced by backups
    #[error("repository {id} still holds {count} backups")]
    RepositoryInUse { id: String, count: i64 },

    /// Chain invariant or chain bookkeeping failure
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Repository operation failure with context
    #[error("repository {id}: {op}: {message}")]
    Repository {
        id: String,
        op: &'static str,
        message: String,
    },

    /// Image tool invocation failure
    #[error("qemu-img {op} on {path}: {message}")]
    ImageTool {
        op: &'static str,
        path: String,
        message: String,
    },

    /// Input malformed
    #[error("validation: {0}")]
    Validation(String),

    /// Checksum mismatch during copy verification
    #[error("checksum mismatch: source {source_digest} != destination {dest_digest}")]
    ChecksumMismatch {
        source_digest: String,
        dest_digest: String,
    },

    /// Database failure
    #[error(transparent)]
    Db(#[from] haven_db::DbError),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Chain-specific error with the failing operation attached.
#[derive(Error, Debug)]
#[error("chain {chain_id}: {op}: {message}")]
pub struct ChainError {
    pub chain_id: String,
    pub op: &'static str,
    pub message: String,
}

impl ChainError {
    pub fn new(chain_id: impl Into<String>, op: &'static str, message: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            op,
            message: message.into(),
        }
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Broad failure category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::BackupNotFound(_) | StorageError::RepositoryNotFound(_) => {
                ErrorKind::NotFound
            }
            StorageError::HasDependents(_)
            | StorageError::RepositoryInUse { .. }
            | StorageError::Chain(_)
            | StorageError::ChecksumMismatch { .. } => ErrorKind::Conflict,
            StorageError::ParentBackupRequired
            | StorageError::InvalidBackupType(_)
            | StorageError::Validation(_) => ErrorKind::Validation,
            StorageError::ImageTool { .. } | StorageError::Repository { .. } => {
                ErrorKind::Dependency
            }
            StorageError::Db(e) => e.kind(),
            StorageError::Io(_) | StorageError::Serialization(_) => ErrorKind::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_error_rendering() {
        let err = ChainError::new("chain-ctx-disk0", "validate", "must start with full");
        assert_eq!(
            err.to_string(),
            "chain chain-ctx-disk0: validate: must start with full"
        );
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            StorageError::ParentBackupRequired.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            StorageError::HasDependents("b".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            StorageError::BackupNotFound("b".into()).kind(),
            ErrorKind::NotFound
        );
    }
}
