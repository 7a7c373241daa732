//! # Haven Core
//!
//! Shared domain types for the Haven disaster-recovery control plane.
//!
//! This crate carries the vocabulary the rest of the workspace speaks:
//! backup, chain, repository, flow and schedule types, the error taxonomy
//! every component classifies its failures with, and the process-wide
//! [`Config`] aggregate.
//!
//! Nothing in here performs I/O. Components that move data or talk to the
//! database live in the sibling crates (`haven-db`, `haven-storage`,
//! `haven-nbd`, `haven-scheduler`, `haven-flows`).

pub mod config;
pub mod error;
pub mod ids;
pub mod types;

pub use config::Config;
pub use error::{CoreError, ErrorKind};
pub use types::{
    BackupStatus, BackupType, CopyMode, CopyStatus, ExecutionStatus, ExecutionType, FlowType,
    RepositoryType, TargetType, VerificationStatus,
};

/// Version information for the platform.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
