//! Local-filesystem repository engine, the reference implementation.

use crate::chain::ChainManager;
use crate::engine::{
    backup_file_path, chain_dir, CreateBackupRequest, RepositoryEngine, StorageInfo,
};
use crate::error::{StorageError, StorageResult};
use crate::qcow2::Qcow2Tool;
use crate::sidecar::{self, BackupSidecar, ChainSidecar};
use async_trait::async_trait;
use chrono::Utc;
use haven_core::{ids, BackupType};
use haven_db::models::BackupJob;
use haven_db::{BackupJobStore, Pool};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Backup CRUD on a locally mounted directory tree.
pub struct LocalEngine {
    repository_id: String,
    base_path: PathBuf,
    qcow2: Qcow2Tool,
    backups: BackupJobStore,
    chains: Arc<ChainManager>,
}

impl LocalEngine {
    /// Create an engine rooted at `base_path`.
    pub fn new(
        repository_id: impl Into<String>,
        base_path: impl Into<PathBuf>,
        qcow2: Qcow2Tool,
        pool: Pool,
        chains: Arc<ChainManager>,
    ) -> Self {
        Self {
            repository_id: repository_id.into(),
            base_path: base_path.into(),
            qcow2,
            backups: BackupJobStore::new(&pool),
            chains,
        }
    }

    /// Write the image and chain sidecars. Failures are logged, never fatal.
    async fn write_sidecars(&self, job: &BackupJob) {
        let file = Path::new(&job.file_path);

        match self.qcow2.info(file).await {
            Ok(info) => {
                let sidecar = BackupSidecar::from_job(job, &info);
                if let Err(e) = sidecar::save_backup_sidecar(file, &sidecar) {
                    warn!(backup_id = %job.id, error = %e, "failed to write backup sidecar");
                }
            }
            Err(e) => {
                warn!(backup_id = %job.id, error = %e, "failed to read image info for sidecar");
            }
        }

        match self.chains.get(&job.vm_context_id, job.disk_index).await {
            Ok(chain) => {
                let member_ids = chain.members.iter().map(|m| m.id.clone()).collect();
                let sidecar = ChainSidecar::from_chain(&chain.chain, member_ids);
                let dir = chain_dir(&self.base_path, &job.vm_context_id, job.disk_index);
                if let Err(e) = sidecar::save_chain_sidecar(&dir, &sidecar) {
                    warn!(chain_id = %chain.chain.id, error = %e, "failed to write chain sidecar");
                }
            }
            Err(e) => {
                warn!(backup_id = %job.id, error = %e, "failed to load chain for sidecar");
            }
        }
    }

    async fn fetch_owned(&self, backup_id: &str) -> StorageResult<BackupJob> {
        let job = self
            .backups
            .find(backup_id)
            .await?
            .ok_or_else(|| StorageError::BackupNotFound(backup_id.to_string()))?;

        if job.repository_id != self.repository_id {
            return Err(StorageError::BackupNotFound(backup_id.to_string()));
        }

        Ok(job)
    }
}

#[async_trait]
impl RepositoryEngine for LocalEngine {
    fn repository_id(&self) -> &str {
        &self.repository_id
    }

    fn base_path(&self) -> &Path {
        &self.base_path
    }

    async fn create_backup(&self, request: CreateBackupRequest) -> StorageResult<BackupJob> {
        let chain = self
            .chains
            .get_or_create(&request.vm_context_id, request.disk_index)
            .await?;

        let now = Utc::now();
        let backup_id = ids::backup_id(&request.vm_name, request.disk_index, now);
        let file_path = backup_file_path(
            &self.base_path,
            &request.vm_context_id,
            request.disk_index,
            &backup_id,
        );

        match request.backup_type {
            BackupType::Full => {
                self.qcow2
                    .create_full(&file_path, request.total_bytes)
                    .await?;
            }
            BackupType::Incremental => {
                let parent_id = request
                    .parent_backup_id
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .ok_or(StorageError::ParentBackupRequired)?;

                let parent = self.fetch_owned(parent_id).await?;
                self.qcow2
                    .create_incremental(&file_path, Path::new(&parent.file_path))
                    .await?;
            }
            BackupType::Differential => {
                return Err(StorageError::InvalidBackupType(
                    request.backup_type.to_string(),
                ));
            }
        }

        let job = BackupJob {
            id: backup_id,
            vm_context_id: request.vm_context_id.clone(),
            vm_name: request.vm_name.clone(),
            disk_index: request.disk_index,
            backup_type: request.backup_type.to_string(),
            status: "pending".to_string(),
            parent_backup_id: request.parent_backup_id.clone(),
            change_id: request.change_id.clone(),
            repository_id: self.repository_id.clone(),
            file_path: file_path.display().to_string(),
            size_bytes: 0,
            total_bytes: request.total_bytes,
            bytes_transferred: 0,
            progress_percent: 0.0,
            transfer_speed_bps: 0,
            eta_seconds: 0,
            current_phase: String::new(),
            error_message: None,
            created_at: now,
            completed_at: None,
            last_telemetry_at: None,
        };

        if let Err(e) = self.backups.create(&job).await {
            // The row is the source of truth; a file without one is litter.
            if let Err(unlink) = std::fs::remove_file(&file_path) {
                warn!(path = %file_path.display(), error = %unlink, "failed to remove orphaned backup file");
            }
            return Err(e.into());
        }

        self.chains.add_backup(&chain.id, &job).await?;
        self.write_sidecars(&job).await;

        debug!(backup_id = %job.id, path = %job.file_path, "created backup");
        Ok(job)
    }

    async fn get_backup(&self, backup_id: &str) -> StorageResult<BackupJob> {
        self.fetch_owned(backup_id).await
    }

    async fn list_backups(&self) -> StorageResult<Vec<BackupJob>> {
        Ok(self.backups.list_by_repository(&self.repository_id).await?)
    }

    async fn delete_backup(&self, backup_id: &str) -> StorageResult<()> {
        let job = self.fetch_owned(backup_id).await?;

        if !self.chains.can_delete(backup_id).await? {
            return Err(StorageError::HasDependents(backup_id.to_string()));
        }

        let chain_id = ids::chain_id(&job.vm_context_id, job.disk_index);
        self.chains.remove_backup(&chain_id, backup_id).await?;
        self.backups.delete(backup_id).await?;

        // File and sidecar removal are best-effort once the row is gone.
        if let Err(e) = std::fs::remove_file(&job.file_path) {
            warn!(path = %job.file_path, error = %e, "failed to unlink backup file");
        }
        let sidecar_path = sidecar::backup_sidecar_path(Path::new(&job.file_path));
        if let Err(e) = std::fs::remove_file(&sidecar_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %sidecar_path.display(), error = %e, "failed to unlink sidecar");
            }
        }

        debug!(backup_id, "deleted backup");
        Ok(())
    }

    async fn get_storage_info(&self) -> StorageResult<StorageInfo> {
        let stat = nix::sys::statvfs::statvfs(&self.base_path).map_err(|e| {
            StorageError::Repository {
                id: self.repository_id.clone(),
                op: "statvfs",
                message: e.to_string(),
            }
        })?;

        let block = stat.fragment_size() as i64;
        let total = stat.blocks() as i64 * block;
        let available = stat.blocks_available() as i64 * block;

        Ok(StorageInfo {
            total_bytes: total,
            used_bytes: total - stat.blocks_free() as i64 * block,
            available_bytes: available,
            backup_count: self.backups.count_in_repository(&self.repository_id).await?,
        })
    }

    async fn get_export_path(&self, backup_id: &str) -> StorageResult<PathBuf> {
        let job = self.fetch_owned(backup_id).await?;
        let path = PathBuf::from(&job.file_path);

        if !path.exists() {
            return Err(StorageError::Repository {
                id: self.repository_id.clone(),
                op: "export_path",
                message: format!("backup file missing: {}", path.display()),
            });
        }

        Ok(path)
    }

    async fn apply_write_protection(&self, backup_id: &str) -> StorageResult<()> {
        let job = self.fetch_owned(backup_id).await?;
        let path = Path::new(&job.file_path);

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o444))?;

        let sidecar_path = sidecar::backup_sidecar_path(path);
        if sidecar_path.exists() {
            std::fs::set_permissions(&sidecar_path, std::fs::Permissions::from_mode(0o444))?;
        }

        debug!(backup_id, "applied write protection");
        Ok(())
    }
}
