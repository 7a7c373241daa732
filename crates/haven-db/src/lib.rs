//! # Haven DB
//!
//! Typed Postgres persistence for every control-plane entity: backup jobs,
//! chains, repositories, policies and copies, protection flows and their
//! executions, schedules, groups and VM contexts.
//!
//! The query modules expose one store struct per entity family. Complex
//! transactional updates (chain head/tail) run under row locks; terminal
//! status transitions use conditional updates so they fire exactly once.

pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
pub mod transaction;

pub use error::{DbError, DbResult};
pub use migrations::MigrationManager;
pub use pool::{Pool, PoolConfig};
pub use transaction::TransactionManager;

pub use queries::backups::BackupJobStore;
pub use queries::chains::ChainStore;
pub use queries::flows::FlowStore;
pub use queries::policies::PolicyStore;
pub use queries::repositories::RepositoryStore;
pub use queries::schedules::ScheduleStore;
pub use queries::vm_contexts::VmContextStore;
