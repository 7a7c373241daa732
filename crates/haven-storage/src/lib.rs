//! # Haven Storage
//!
//! The backup storage engine: QCOW2-chain repositories over local, NFS and
//! CIFS backends, chain tracking with the at-most-one-full invariant,
//! atomic metadata sidecars, multi-repository copy replication and
//! grace-period immutability.
//!
//! Layering, leaves first: [`qcow2`] wraps the image tool, [`mount`] owns
//! network shares, [`sidecar`] writes metadata next to image files,
//! [`chain`] guards chain integrity, [`engine`] implements per-backend
//! backup CRUD, [`manager`] keeps the registry of live repositories, and
//! [`copy`]/[`grace`] are the background workers over finished backups.

pub mod chain;
pub mod copy;
pub mod engine;
pub mod error;
pub mod grace;
pub mod manager;
pub mod mount;
pub mod qcow2;
pub mod sidecar;

pub use chain::ChainManager;
pub use copy::CopyEngine;
pub use engine::{CreateBackupRequest, RepositoryEngine, StorageInfo};
pub use error::{ChainError, StorageError, StorageResult};
pub use grace::GracePeriodWorker;
pub use manager::RepositoryManager;
pub use mount::MountManager;
pub use qcow2::{Qcow2Info, Qcow2Tool};
