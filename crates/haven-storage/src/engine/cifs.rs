//! CIFS/SMB repository engine: the local engine behind a mount gate.

use crate::engine::{CreateBackupRequest, LocalEngine, RepositoryEngine, StorageInfo};
use crate::error::{StorageError, StorageResult};
use crate::mount::MountManager;
use async_trait::async_trait;
use haven_db::models::BackupJob;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Type-specific payload of a CIFS repository config. Credentials are
/// referenced, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CifsConfig {
    pub server: String,
    pub share: String,
    pub mount_point: PathBuf,
    pub secret_ref: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub opts: String,
}

/// Local engine wrapped with CIFS mount lifecycle.
pub struct CifsEngine {
    inner: LocalEngine,
    mount: Arc<MountManager>,
    config: CifsConfig,
    mounted: RwLock<bool>,
}

impl CifsEngine {
    /// Create a CIFS engine; the inner local engine must be rooted at the
    /// mount point.
    pub fn new(inner: LocalEngine, mount: Arc<MountManager>, config: CifsConfig) -> Self {
        Self {
            inner,
            mount,
            config,
            mounted: RwLock::new(false),
        }
    }

    async fn ensure_mounted(&self) -> StorageResult<()> {
        if *self.mounted.read().await {
            return Ok(());
        }

        let mut mounted = self.mounted.write().await;
        if *mounted {
            return Ok(());
        }

        if self.mount.is_mounted(&self.config.mount_point)? {
            *mounted = true;
            return Ok(());
        }

        self.mount
            .mount_cifs(
                &self.config.server,
                &self.config.share,
                &self.config.mount_point,
                &self.config.secret_ref,
                self.config.domain.as_deref(),
                &self.config.opts,
            )
            .await
            .map_err(|e| StorageError::Repository {
                id: self.inner.repository_id().to_string(),
                op: "mount_cifs",
                message: e.to_string(),
            })?;

        *mounted = true;
        debug!(repository_id = %self.inner.repository_id(), "CIFS share mounted");
        Ok(())
    }

    /// Unmount the share. Refused while not mounted.
    pub async fn unmount(&self, lazy: bool) -> StorageResult<()> {
        let mut mounted = self.mounted.write().await;
        if !*mounted {
            return Err(StorageError::Repository {
                id: self.inner.repository_id().to_string(),
                op: "unmount",
                message: "repository is not mounted".to_string(),
            });
        }

        self.mount.unmount(&self.config.mount_point, lazy).await?;
        *mounted = false;
        Ok(())
    }
}

#[async_trait]
impl RepositoryEngine for CifsEngine {
    fn repository_id(&self) -> &str {
        self.inner.repository_id()
    }

    fn base_path(&self) -> &Path {
        self.inner.base_path()
    }

    async fn create_backup(&self, request: CreateBackupRequest) -> StorageResult<BackupJob> {
        self.ensure_mounted().await?;
        self.inner.create_backup(request).await
    }

    async fn get_backup(&self, backup_id: &str) -> StorageResult<BackupJob> {
        self.ensure_mounted().await?;
        self.inner.get_backup(backup_id).await
    }

    async fn list_backups(&self) -> StorageResult<Vec<BackupJob>> {
        self.ensure_mounted().await?;
        self.inner.list_backups().await
    }

    async fn delete_backup(&self, backup_id: &str) -> StorageResult<()> {
        self.ensure_mounted().await?;
        self.inner.delete_backup(backup_id).await
    }

    async fn get_storage_info(&self) -> StorageResult<StorageInfo> {
        self.ensure_mounted().await?;
        self.inner.get_storage_info().await
    }

    async fn get_export_path(&self, backup_id: &str) -> StorageResult<PathBuf> {
        self.ensure_mounted().await?;
        self.inner.get_export_path(backup_id).await
    }

    async fn apply_write_protection(&self, backup_id: &str) -> StorageResult<()> {
        self.ensure_mounted().await?;
        self.inner.apply_write_protection(backup_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cifs_config_never_carries_a_password() {
        let config: CifsConfig = serde_json::from_str(
            r#"{"server": "filer01", "share": "backups",
                "mount_point": "/mnt/haven-cifs",
                "secret_ref": "vault:cifs/filer01", "domain": "CORP"}"#,
        )
        .unwrap();
        assert_eq!(config.secret_ref, "vault:cifs/filer01");

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("password"));
    }
}
