//! Per-backend backup CRUD.
//!
//! [`local::LocalEngine`] is the reference implementation; the NFS and CIFS
//! engines compose it behind a mount gate, delegating file operations
//! unchanged once the share is mounted.

pub mod cifs;
pub mod local;
pub mod nfs;

use crate::error::StorageResult;
use async_trait::async_trait;
use haven_core::BackupType;
use haven_db::models::BackupJob;
use std::path::{Path, PathBuf};

pub use cifs::CifsEngine;
pub use local::LocalEngine;
pub use nfs::NfsEngine;

/// Request to create one backup file and its job row.
#[derive(Debug, Clone)]
pub struct CreateBackupRequest {
    pub vm_context_id: String,
    pub vm_name: String,
    pub disk_index: i32,
    pub backup_type: BackupType,
    /// Required for incrementals: the backup to back onto.
    pub parent_backup_id: Option<String>,
    /// Hypervisor CBT token of the snapshot point.
    pub change_id: Option<String>,
    /// Virtual size of the disk in bytes.
    pub total_bytes: i64,
}

/// Capacity snapshot of a repository's backing store.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
    /// Number of backup rows referencing this repository.
    pub backup_count: i64,
}

/// Backup CRUD against one repository backend.
#[async_trait]
pub trait RepositoryEngine: Send + Sync {
    /// Repository this engine serves.
    fn repository_id(&self) -> &str;

    /// Create the QCOW2 file and the pending job row.
    async fn create_backup(&self, request: CreateBackupRequest) -> StorageResult<BackupJob>;

    /// Fetch one backup belonging to this repository.
    async fn get_backup(&self, backup_id: &str) -> StorageResult<BackupJob>;

    /// Backups in this repository, newest first.
    async fn list_backups(&self) -> StorageResult<Vec<BackupJob>>;

    /// Delete a backup: refused while dependents exist; the row goes first,
    /// file and sidecar removal are best-effort afterwards.
    async fn delete_backup(&self, backup_id: &str) -> StorageResult<()>;

    /// Capacity snapshot of the backing store.
    async fn get_storage_info(&self) -> StorageResult<StorageInfo>;

    /// Path of the backup file, validated to exist.
    async fn get_export_path(&self, backup_id: &str) -> StorageResult<PathBuf>;

    /// Clear write permission bits on a finished backup and its sidecar.
    async fn apply_write_protection(&self, backup_id: &str) -> StorageResult<()>;

    /// Base directory backups land under.
    fn base_path(&self) -> &Path;
}

/// Canonical backup file layout:
/// `<base>/<vm_context_id>/disk-<n>/<backup_id>.qcow2`.
pub fn backup_file_path(
    base: &Path,
    vm_context_id: &str,
    disk_index: i32,
    backup_id: &str,
) -> PathBuf {
    chain_dir(base, vm_context_id, disk_index).join(format!("{}.qcow2", backup_id))
}

/// Chain directory for one (VM context, disk).
pub fn chain_dir(base: &Path, vm_context_id: &str, disk_index: i32) -> PathBuf {
    base.join(vm_context_id).join(format!("disk-{}", disk_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_file_layout() {
        let path = backup_file_path(
            Path::new("/tmp/r"),
            "ctx-web01",
            0,
            "backup-web01-disk0-20250101-000000",
        );
        assert_eq!(
            path,
            PathBuf::from("/tmp/r/ctx-web01/disk-0/backup-web01-disk0-20250101-000000.qcow2")
        );
    }

    #[test]
    fn test_chain_dir_layout() {
        assert_eq!(
            chain_dir(Path::new("/srv/backups"), "ctx-db02", 3),
            PathBuf::from("/srv/backups/ctx-db02/disk-3")
        );
    }
}
