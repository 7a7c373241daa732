//! Error taxonomy shared across the control plane.

use thiserror::Error;

/// Broad failure categories used by every component when classifying an
/// error for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Entity absent.
    NotFound,
    /// State precondition violated (chain invariants, allocator exhaustion).
    Conflict,
    /// Input malformed.
    Validation,
    /// I/O or database failure.
    Storage,
    /// External tool or service failure.
    Dependency,
    /// Recoverable, retry later.
    Transient,
}

impl ErrorKind {
    /// Whether an operation that failed with this kind is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Context-carrying error for operations against a named entity.
///
/// Rendered as `<entity_id>: <op>: <cause>` so call-site messages are
/// uniform across components.
#[derive(Error, Debug)]
#[error("{entity_id}: {op}: {cause}")]
pub struct CoreError {
    /// Identifier of the entity the operation targeted.
    pub entity_id: String,
    /// Operation that failed.
    pub op: String,
    /// Failure category.
    pub kind: ErrorKind,
    /// Underlying cause.
    #[source]
    pub cause: Box<dyn std::error::Error + Send + Sync>,
}

impl CoreError {
    /// Wrap a cause with entity and operation context.
    pub fn new(
        entity_id: impl Into<String>,
        op: impl Into<String>,
        kind: ErrorKind,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            op: op.into(),
            kind,
            cause: cause.into(),
        }
    }

    /// Failure category for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rendering() {
        let err = CoreError::new(
            "repo-1",
            "mount_nfs",
            ErrorKind::Dependency,
            "mount exited with status 32",
        );
        assert_eq!(err.to_string(), "repo-1: mount_nfs: mount exited with status 32");
        assert_eq!(err.kind(), ErrorKind::Dependency);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
    }
}
