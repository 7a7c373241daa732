//! Copy engine: replicates finished backups to secondary repositories.
//!
//! A fixed pool of workers ticks every 30 seconds. Claiming a copy is the
//! atomic pop-and-mark in [`haven_db::PolicyStore::claim_next_pending`], so
//! workers never double-process. Copies try a reflink clone first and fall
//! back to a streamed copy with fsync, then verify both sides with SHA-256.

use crate::engine::chain_dir;
use crate::error::{StorageError, StorageResult};
use crate::manager::{LocalConfig, RepositoryManager};
use chrono::Utc;
use haven_db::models::{BackupCopy, BackupJob, Repository};
use haven_db::{BackupJobStore, PolicyStore, Pool, RepositoryStore};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Copy engine configuration.
#[derive(Debug, Clone)]
pub struct CopyEngineConfig {
    pub workers: usize,
    pub tick: Duration,
}

impl Default for CopyEngineConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            tick: Duration::from_secs(30),
        }
    }
}

/// Worker pool replicating backups per policy copy rules.
pub struct CopyEngine {
    config: CopyEngineConfig,
    policies: Arc<PolicyStore>,
    backups: Arc<BackupJobStore>,
    repositories: Arc<RepositoryStore>,
    manager: Arc<RepositoryManager>,
}

impl CopyEngine {
    /// Create a copy engine over the shared pool.
    pub fn new(config: CopyEngineConfig, pool: Pool, manager: Arc<RepositoryManager>) -> Self {
        Self {
            config,
            policies: Arc::new(PolicyStore::new(&pool)),
            backups: Arc::new(BackupJobStore::new(&pool)),
            repositories: Arc::new(RepositoryStore::new(&pool)),
            manager,
        }
    }

    /// Queue pending copies for every immediate-mode rule of a policy.
    /// Scheduled and manual rules are queued through [`Self::enqueue_manual`]
    /// by their own triggers.
    pub async fn enqueue_for_policy(
        &self,
        policy_id: Uuid,
        backup: &BackupJob,
    ) -> StorageResult<usize> {
        let rules = self.policies.list_copy_rules(policy_id).await?;
        let mut queued = 0;

        for rule in rules.iter().filter(|r| r.mode == "immediate") {
            self.insert_pending(backup, &rule.destination_repository_id)
                .await?;
            queued += 1;
        }

        Ok(queued)
    }

    /// Queue one pending copy explicitly (manual and scheduled rules).
    pub async fn enqueue_manual(
        &self,
        backup: &BackupJob,
        destination_repository_id: &str,
    ) -> StorageResult<()> {
        self.insert_pending(backup, destination_repository_id).await
    }

    async fn insert_pending(
        &self,
        backup: &BackupJob,
        destination_repository_id: &str,
    ) -> StorageResult<()> {
        let copy = BackupCopy {
            id: Uuid::new_v4(),
            source_backup_id: backup.id.clone(),
            destination_repository_id: destination_repository_id.to_string(),
            file_path: String::new(),
            size_bytes: 0,
            status: "pending".to_string(),
            verification_status: "pending".to_string(),
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        self.policies.insert_copy(&copy).await?;
        debug!(copy_id = %copy.id, backup_id = %backup.id, dest = destination_repository_id, "queued backup copy");
        Ok(())
    }

    /// Spawn the worker pool. Workers drain on shutdown signal.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let engine = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(engine.config.tick);
                    info!(worker, "copy worker started");
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                if let Err(e) = engine.run_once(worker).await {
                                    // A single failed copy never takes the pool down.
                                    error!(worker, error = %e, "copy worker pass failed");
                                }
                            }
                            _ = shutdown.changed() => {
                                info!(worker, "copy worker stopping");
                                return;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Claim and process at most one pending copy.
    pub async fn run_once(&self, worker: usize) -> StorageResult<()> {
        let Some(copy) = self.policies.claim_next_pending().await? else {
            return Ok(());
        };

        debug!(worker, copy_id = %copy.id, "claimed backup copy");
        if let Err(e) = self.process(&copy).await {
            warn!(copy_id = %copy.id, error = %e, "backup copy failed");
            self.policies.fail_copy(copy.id, &e.to_string()).await?;
        }

        Ok(())
    }

    async fn process(&self, copy: &BackupCopy) -> StorageResult<()> {
        let source_job = self.backups.get(&copy.source_backup_id).await?;

        let source_engine = self.manager.get(&source_job.repository_id).await?;
        let source_path = source_engine.get_export_path(&source_job.id).await?;

        let dest_repo = self
            .repositories
            .get(&copy.destination_repository_id)
            .await?;
        let dest_base = destination_base_path(&dest_repo)?;
        let dest_path = copy_destination_path(&dest_base, &source_job, &source_path);

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        copy_file(&source_path, &dest_path).await?;
        let size = tokio::fs::metadata(&dest_path).await?.len() as i64;

        self.policies
            .update_copy_status(
                copy.id,
                "verifying",
                Some(&dest_path.display().to_string()),
                Some(size),
            )
            .await?;

        let source_digest = sha256_file(&source_path).await?;
        let dest_digest = sha256_file(&dest_path).await?;

        if source_digest != dest_digest {
            self.policies.set_verification(copy.id, "failed").await?;
            // The mismatching destination stays on disk for manual triage.
            return Err(StorageError::ChecksumMismatch {
                source_digest,
                dest_digest,
            });
        }

        self.policies.set_verification(copy.id, "passed").await?;
        self.policies
            .update_copy_status(copy.id, "completed", None, None)
            .await?;

        info!(copy_id = %copy.id, backup_id = %source_job.id, dest = %dest_path.display(), "backup copy verified");
        Ok(())
    }
}

/// Base path of a copy destination, derived from the repository type.
pub fn destination_base_path(repo: &Repository) -> StorageResult<PathBuf> {
    match repo.repo_type.as_str() {
        "local" => {
            let config: LocalConfig = serde_json::from_value(repo.config.clone())?;
            Ok(config.path)
        }
        "nfs" | "cifs" => {
            let mount_point = repo
                .config
                .get("mount_point")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    StorageError::Validation(format!(
                        "repository {} has no mount_point",
                        repo.id
                    ))
                })?;
            Ok(PathBuf::from(mount_point))
        }
        other => Err(StorageError::Validation(format!(
            "cannot copy to repository type {}",
            other
        ))),
    }
}

/// Destination layout mirrors the source: `<base>/<ctx>/disk-<n>/<basename>`.
pub fn copy_destination_path(base: &Path, job: &BackupJob, source: &Path) -> PathBuf {
    let basename = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.qcow2", job.id));
    chain_dir(base, &job.vm_context_id, job.disk_index).join(basename)
}

/// Reflink when the filesystem can, streamed copy with fsync otherwise.
async fn copy_file(source: &Path, dest: &Path) -> StorageResult<()> {
    match try_reflink(source, dest) {
        Ok(()) => {
            debug!(source = %source.display(), dest = %dest.display(), "reflink clone");
            return Ok(());
        }
        Err(e) => {
            debug!(error = %e, "reflink unavailable, streaming copy");
        }
    }

    tokio::fs::copy(source, dest).await?;
    let file = tokio::fs::File::open(dest).await?;
    file.sync_all().await?;
    Ok(())
}

mod ficlone {
    nix::ioctl_write_int_bad!(ficlone, 0x4004_9409);
}

/// Clone via `ioctl(FICLONE)`; fails on filesystems without CoW support
/// and across filesystem boundaries.
fn try_reflink(source: &Path, dest: &Path) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let src = std::fs::File::open(source)?;
    let dst = std::fs::File::create(dest)?;

    unsafe { ficlone::ficlone(dst.as_raw_fd(), src.as_raw_fd()) }.map_err(|e| {
        let _ = std::fs::remove_file(dest);
        std::io::Error::from_raw_os_error(e as i32)
    })?;

    Ok(())
}

/// Streaming SHA-256 of a file, hex-encoded.
pub async fn sha256_file(path: &Path) -> StorageResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job() -> BackupJob {
        BackupJob {
            id: "backup-web01-disk0-20250101-000000".to_string(),
            vm_context_id: "ctx-web01".to_string(),
            vm_name: "web01".to_string(),
            disk_index: 0,
            backup_type: "full".to_string(),
            status: "completed".to_string(),
            parent_backup_id: None,
            change_id: None,
            repository_id: "repo-primary".to_string(),
            file_path: "/srv/primary/ctx-web01/disk-0/b.qcow2".to_string(),
            size_bytes: 4096,
            total_bytes: 4096,
            bytes_transferred: 4096,
            progress_percent: 100.0,
            transfer_speed_bps: 0,
            eta_seconds: 0,
            current_phase: String::new(),
            error_message: None,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
            last_telemetry_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_copy_destination_mirrors_source_layout() {
        let dest = copy_destination_path(
            Path::new("/mnt/secondary"),
            &job(),
            Path::new("/srv/primary/ctx-web01/disk-0/b.qcow2"),
        );
        assert_eq!(
            dest,
            PathBuf::from("/mnt/secondary/ctx-web01/disk-0/b.qcow2")
        );
    }

    #[test]
    fn test_destination_base_path_by_type() {
        let mut repo = Repository {
            id: "repo-2".to_string(),
            name: "secondary".to_string(),
            repo_type: "local".to_string(),
            config: serde_json::json!({"path": "/srv/secondary"}),
            enabled: true,
            is_immutable: false,
            min_retention_days: 0,
            grace_period_days: 7,
            total_bytes: 0,
            used_bytes: 0,
            available_bytes: 0,
            last_check_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(
            destination_base_path(&repo).unwrap(),
            PathBuf::from("/srv/secondary")
        );

        repo.repo_type = "nfs".to_string();
        repo.config = serde_json::json!({"server": "nas", "export": "/e", "mount_point": "/mnt/nfs"});
        assert_eq!(
            destination_base_path(&repo).unwrap(),
            PathBuf::from("/mnt/nfs")
        );

        repo.repo_type = "s3".to_string();
        assert!(destination_base_path(&repo).is_err());
    }

    #[tokio::test]
    async fn test_sha256_file_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let digest = sha256_file(&path).await.unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_copy_file_contents_match() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.qcow2");
        let dst = dir.path().join("dst.qcow2");
        tokio::fs::write(&src, vec![7u8; 128 * 1024]).await.unwrap();

        copy_file(&src, &dst).await.unwrap();

        let a = sha256_file(&src).await.unwrap();
        let b = sha256_file(&dst).await.unwrap();
        assert_eq!(a, b);
    }
}
