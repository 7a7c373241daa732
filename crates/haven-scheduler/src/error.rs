//! Scheduler errors.

use haven_core::ErrorKind;
use thiserror::Error;

/// Errors from schedule registration and execution.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Schedule absent
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    /// Cron expression failed to parse
    #[error("invalid cron expression {expression}: {message}")]
    InvalidCron { expression: String, message: String },

    /// Timezone failed to parse
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Database failure
    #[error(transparent)]
    Db(#[from] haven_db::DbError),

    /// Flow dispatch failure
    #[error(transparent)]
    Flow(#[from] haven_flows::FlowError),
}

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    /// Broad failure category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::ScheduleNotFound(_) => ErrorKind::NotFound,
            SchedulerError::InvalidCron { .. } | SchedulerError::InvalidTimezone(_) => {
                ErrorKind::Validation
            }
            SchedulerError::Db(e) => e.kind(),
            SchedulerError::Flow(e) => e.kind(),
        }
    }
}
