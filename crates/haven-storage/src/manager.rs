//! Registry of active repository engines.
//!
//! Holds one constructed engine per enabled repository config. Reads are
//! common and share a read lock; writes happen only on register, update
//! and delete.

use crate::chain::ChainManager;
use crate::engine::cifs::{CifsConfig, CifsEngine};
use crate::engine::local::LocalEngine;
use crate::engine::nfs::{NfsConfig, NfsEngine};
use crate::engine::RepositoryEngine;
use crate::error::{StorageError, StorageResult};
use crate::mount::MountManager;
use crate::qcow2::Qcow2Tool;
use chrono::Utc;
use haven_core::RepositoryType;
use haven_db::models::Repository;
use haven_db::{BackupJobStore, Pool, RepositoryStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Type-specific payload of a local repository config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub auto_mount: bool,
    #[serde(default)]
    pub mount_opts: String,
}

/// Registry of `(repo_id -> engine)` with the frozen config.
pub struct RepositoryManager {
    pool: Pool,
    store: RepositoryStore,
    backups: BackupJobStore,
    qcow2: Qcow2Tool,
    mount: Arc<MountManager>,
    chains: Arc<ChainManager>,
    engines: Arc<RwLock<HashMap<String, Arc<dyn RepositoryEngine>>>>,
}

impl RepositoryManager {
    /// Create an empty registry.
    pub fn new(
        pool: Pool,
        qcow2: Qcow2Tool,
        mount: Arc<MountManager>,
        chains: Arc<ChainManager>,
    ) -> Self {
        let store = RepositoryStore::new(&pool);
        let backups = BackupJobStore::new(&pool);
        Self {
            pool,
            store,
            backups,
            qcow2,
            mount,
            chains,
            engines: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Load every enabled repository config and construct its engine.
    /// Per-repository failures are logged and skipped.
    pub async fn start(&self) -> StorageResult<usize> {
        let configs = self.store.list_enabled().await?;
        let mut started = 0;

        for config in configs {
            match self.build_engine(&config) {
                Ok(engine) => {
                    self.engines.write().await.insert(config.id.clone(), engine);
                    info!(repository_id = %config.id, repo_type = %config.repo_type, "repository initialised");
                    started += 1;
                }
                Err(e) => {
                    error!(repository_id = %config.id, error = %e, "skipping repository");
                }
            }
        }

        Ok(started)
    }

    /// Engine for a repository id.
    pub async fn get(&self, repo_id: &str) -> StorageResult<Arc<dyn RepositoryEngine>> {
        self.engines
            .read()
            .await
            .get(repo_id)
            .cloned()
            .ok_or_else(|| StorageError::RepositoryNotFound(repo_id.to_string()))
    }

    /// Ids of all active repositories.
    pub async fn list_ids(&self) -> Vec<String> {
        self.engines.read().await.keys().cloned().collect()
    }

    /// Validate, test, persist and initialise a new repository. When engine
    /// construction fails after the row was written, the row is rolled
    /// back so configs and engines stay in step.
    pub async fn register(&self, config: Repository) -> StorageResult<()> {
        validate_config(&config)?;
        self.test_connectivity(&config)?;

        self.store.insert(&config).await?;

        match self.build_engine(&config) {
            Ok(engine) => {
                self.engines.write().await.insert(config.id.clone(), engine);
                info!(repository_id = %config.id, "repository registered");
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.store.delete(&config.id).await {
                    warn!(repository_id = %config.id, error = %rollback, "failed to roll back repository row");
                }
                Err(e)
            }
        }
    }

    /// Replace a repository's config and reinitialise its engine under the
    /// write lock.
    pub async fn update(&self, config: Repository) -> StorageResult<()> {
        validate_config(&config)?;

        let mut engines = self.engines.write().await;
        let engine = self.build_engine(&config)?;
        self.store.update(&config).await?;
        engines.insert(config.id.clone(), engine);

        info!(repository_id = %config.id, "repository updated");
        Ok(())
    }

    /// Remove a repository. Refused while backups reference it.
    pub async fn delete(&self, repo_id: &str) -> StorageResult<()> {
        let count = self.backups.count_in_repository(repo_id).await?;
        if count > 0 {
            return Err(StorageError::RepositoryInUse {
                id: repo_id.to_string(),
                count,
            });
        }

        self.engines.write().await.remove(repo_id);
        self.store.delete(repo_id).await?;

        info!(repository_id = repo_id, "repository deleted");
        Ok(())
    }

    /// Probe every active engine and persist its capacity snapshot.
    pub async fn refresh(&self) -> StorageResult<()> {
        let engines: Vec<(String, Arc<dyn RepositoryEngine>)> = {
            let map = self.engines.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (repo_id, engine) in engines {
            match engine.get_storage_info().await {
                Ok(info) => {
                    self.store
                        .update_capacity(
                            &repo_id,
                            info.total_bytes,
                            info.used_bytes,
                            info.available_bytes,
                            Utc::now(),
                        )
                        .await?;
                }
                Err(e) => {
                    warn!(repository_id = %repo_id, error = %e, "capacity refresh failed");
                }
            }
        }

        Ok(())
    }

    /// Construct the per-type engine for a config.
    fn build_engine(&self, config: &Repository) -> StorageResult<Arc<dyn RepositoryEngine>> {
        let repo_type: RepositoryType = config
            .repo_type
            .parse()
            .map_err(StorageError::Validation)?;

        match repo_type {
            RepositoryType::Local => {
                let local: LocalConfig = serde_json::from_value(config.config.clone())?;
                Ok(Arc::new(LocalEngine::new(
                    &config.id,
                    local.path,
                    self.qcow2.clone(),
                    self.pool.clone(),
                    self.chains.clone(),
                )))
            }
            RepositoryType::Nfs => {
                let nfs: NfsConfig = serde_json::from_value(config.config.clone())?;
                let inner = LocalEngine::new(
                    &config.id,
                    nfs.mount_point.clone(),
                    self.qcow2.clone(),
                    self.pool.clone(),
                    self.chains.clone(),
                );
                Ok(Arc::new(NfsEngine::new(inner, self.mount.clone(), nfs)))
            }
            RepositoryType::Cifs => {
                let cifs: CifsConfig = serde_json::from_value(config.config.clone())?;
                let inner = LocalEngine::new(
                    &config.id,
                    cifs.mount_point.clone(),
                    self.qcow2.clone(),
                    self.pool.clone(),
                    self.chains.clone(),
                );
                Ok(Arc::new(CifsEngine::new(inner, self.mount.clone(), cifs)))
            }
            RepositoryType::S3 | RepositoryType::Azure => Err(StorageError::Validation(format!(
                "no engine available for repository type {}",
                repo_type
            ))),
        }
    }

    /// Connectivity test before persisting: path validation for local;
    /// reserved for share types.
    fn test_connectivity(&self, config: &Repository) -> StorageResult<()> {
        let repo_type: RepositoryType = config
            .repo_type
            .parse()
            .map_err(StorageError::Validation)?;

        if repo_type == RepositoryType::Local {
            let local: LocalConfig = serde_json::from_value(config.config.clone())?;
            std::fs::create_dir_all(&local.path).map_err(|e| StorageError::Repository {
                id: config.id.clone(),
                op: "test_connectivity",
                message: format!("{}: {}", local.path.display(), e),
            })?;
        }

        Ok(())
    }
}

/// Structural validation of a repository config.
pub fn validate_config(config: &Repository) -> StorageResult<()> {
    if config.name.trim().is_empty() {
        return Err(StorageError::Validation(
            "repository name must not be empty".to_string(),
        ));
    }

    let repo_type: RepositoryType = config
        .repo_type
        .parse()
        .map_err(StorageError::Validation)?;

    let missing = |field: &str| {
        StorageError::Validation(format!(
            "repository {} is missing required field {}",
            config.id, field
        ))
    };

    let payload = config
        .config
        .as_object()
        .ok_or_else(|| missing("config"))?;

    let require = |field: &str| -> StorageResult<()> {
        match payload.get(field) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Ok(()),
            _ => Err(missing(field)),
        }
    };

    match repo_type {
        RepositoryType::Local => require("path"),
        RepositoryType::Nfs => {
            require("server")?;
            require("export")?;
            require("mount_point")
        }
        RepositoryType::Cifs => {
            require("server")?;
            require("share")?;
            require("mount_point")?;
            require("secret_ref")
        }
        RepositoryType::S3 => {
            require("bucket")?;
            require("region")
        }
        RepositoryType::Azure => {
            require("account")?;
            require("container")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(repo_type: &str, config: serde_json::Value) -> Repository {
        Repository {
            id: "repo-1".to_string(),
            name: "primary".to_string(),
            repo_type: repo_type.to_string(),
            config,
            enabled: true,
            is_immutable: false,
            min_retention_days: 0,
            grace_period_days: 7,
            total_bytes: 0,
            used_bytes: 0,
            available_bytes: 0,
            last_check_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_local_requires_path() {
        let valid = repo("local", serde_json::json!({"path": "/srv/backups"}));
        assert!(validate_config(&valid).is_ok());

        let invalid = repo("local", serde_json::json!({}));
        assert!(validate_config(&invalid).is_err());
    }

    #[test]
    fn test_validate_nfs_fields() {
        let valid = repo(
            "nfs",
            serde_json::json!({"server": "nas01", "export": "/export", "mount_point": "/mnt/nfs"}),
        );
        assert!(validate_config(&valid).is_ok());

        let invalid = repo("nfs", serde_json::json!({"server": "nas01"}));
        assert!(validate_config(&invalid).is_err());
    }

    #[test]
    fn test_validate_cifs_requires_secret_ref() {
        let invalid = repo(
            "cifs",
            serde_json::json!({"server": "filer", "share": "backups", "mount_point": "/mnt/cifs"}),
        );
        assert!(validate_config(&invalid).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let mut config = repo("local", serde_json::json!({"path": "/srv"}));
        config.name = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_unknown_type() {
        let config = repo("tape", serde_json::json!({}));
        assert!(validate_config(&config).is_err());
    }
}
