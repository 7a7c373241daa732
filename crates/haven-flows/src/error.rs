//! Flow orchestration errors.

use haven_core::ErrorKind;
use thiserror::Error;

/// Errors from flow orchestration, telemetry ingest and recovery.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Flow absent
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// Flow exists but is disabled
    #[error("flow {0} is disabled")]
    FlowDisabled(String),

    /// Target resolution produced nothing to protect
    #[error("flow {0} resolved no target VMs")]
    NoTargets(String),

    /// Input malformed
    #[error("validation: {0}")]
    Validation(String),

    /// Data-plane or agent call failure
    #[error("{service} request failed: {message}")]
    Upstream { service: &'static str, message: String },

    /// Database failure
    #[error(transparent)]
    Db(#[from] haven_db::DbError),

    /// Storage engine failure
    #[error(transparent)]
    Storage(#[from] haven_storage::StorageError),

    /// HTTP transport failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for flow operations.
pub type FlowResult<T> = Result<T, FlowError>;

impl FlowError {
    /// Broad failure category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::FlowNotFound(_) => ErrorKind::NotFound,
            FlowError::FlowDisabled(_) | FlowError::NoTargets(_) => ErrorKind::Conflict,
            FlowError::Validation(_) => ErrorKind::Validation,
            FlowError::Upstream { .. } | FlowError::Http(_) => ErrorKind::Dependency,
            FlowError::Db(e) => e.kind(),
            FlowError::Storage(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            FlowError::FlowNotFound("f".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            FlowError::FlowDisabled("f".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            FlowError::Upstream {
                service: "agent",
                message: "timeout".into()
            }
            .kind(),
            ErrorKind::Dependency
        );
    }
}
