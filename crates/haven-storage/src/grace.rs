//! Grace-period worker.
//!
//! Hourly sweep over repositories flagged immutable: backups older than the
//! repository's grace period get their write bits cleared. Individual
//! failures are logged and the sweep continues.

use crate::manager::RepositoryManager;
use chrono::{Duration as ChronoDuration, Utc};
use haven_db::{BackupJobStore, Pool, RepositoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Applies write protection to backups past the grace period.
pub struct GracePeriodWorker {
    tick: Duration,
    repositories: RepositoryStore,
    backups: BackupJobStore,
    manager: Arc<RepositoryManager>,
}

impl GracePeriodWorker {
    /// Create a worker sweeping at the given interval.
    pub fn new(tick: Duration, pool: Pool, manager: Arc<RepositoryManager>) -> Self {
        Self {
            tick,
            repositories: RepositoryStore::new(&pool),
            backups: BackupJobStore::new(&pool),
            manager,
        }
    }

    /// Spawn the sweep loop.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            info!("grace-period worker started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "grace-period sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("grace-period worker stopping");
                        return;
                    }
                }
            }
        })
    }

    /// One sweep over every immutable repository.
    pub async fn run_once(&self) -> crate::error::StorageResult<usize> {
        let repos = self.repositories.list_immutable().await?;
        let mut protected = 0;

        for repo in repos {
            let cutoff = Utc::now() - ChronoDuration::days(repo.grace_period_days as i64);
            let candidates = match self.backups.list_completed_before(&repo.id, cutoff).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(repository_id = %repo.id, error = %e, "failed to list grace candidates");
                    continue;
                }
            };

            if candidates.is_empty() {
                continue;
            }

            let engine = match self.manager.get(&repo.id).await {
                Ok(engine) => engine,
                Err(e) => {
                    warn!(repository_id = %repo.id, error = %e, "no engine for immutable repository");
                    continue;
                }
            };

            for backup in candidates {
                match engine.apply_write_protection(&backup.id).await {
                    Ok(()) => {
                        debug!(backup_id = %backup.id, "write protection applied");
                        protected += 1;
                    }
                    Err(e) => {
                        warn!(backup_id = %backup.id, error = %e, "write protection failed");
                    }
                }
            }
        }

        Ok(protected)
    }
}
