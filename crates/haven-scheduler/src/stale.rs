//! Stale-job detector.
//!
//! The sole recovery path for silently crashed agents: every 30 seconds,
//! running jobs whose telemetry stopped arriving are logged as stalled
//! past one threshold and atomically failed past a second.

use crate::error::SchedulerResult;
use chrono::{Duration as ChronoDuration, Utc};
use haven_db::{BackupJobStore, Pool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Thresholds for the detector.
#[derive(Debug, Clone)]
pub struct StaleConfig {
    /// Seconds without telemetry before a job is logged as stalled.
    pub stale_threshold_secs: i64,
    /// Seconds without telemetry before a job is failed.
    pub failed_threshold_secs: i64,
    /// Pass interval.
    pub tick: Duration,
}

impl Default for StaleConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: 60,
            failed_threshold_secs: 300,
            tick: Duration::from_secs(30),
        }
    }
}

/// Marks running jobs failed once their telemetry goes silent too long.
pub struct StaleJobDetector {
    config: StaleConfig,
    backups: BackupJobStore,
}

impl StaleJobDetector {
    /// Create a detector over the shared pool.
    pub fn new(config: StaleConfig, pool: Pool) -> Self {
        Self {
            config,
            backups: BackupJobStore::new(&pool),
        }
    }

    /// Spawn the detector loop.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick);
            info!("stale-job detector started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "stale-job pass failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("stale-job detector stopping");
                        return;
                    }
                }
            }
        })
    }

    /// One pass: log the stalled, fail the dead. Returns the count failed.
    pub async fn run_once(&self) -> SchedulerResult<usize> {
        let now = Utc::now();
        let stale_cutoff = now - ChronoDuration::seconds(self.config.stale_threshold_secs);
        let jobs = self.backups.list_running_stalled(stale_cutoff).await?;
        let mut failed = 0;

        for job in jobs {
            let silent_for = now - job.last_telemetry_at.unwrap_or(job.created_at);

            if silent_for.num_seconds() >= self.config.failed_threshold_secs {
                let message = stall_message(silent_for.num_seconds());
                match self.backups.fail_if_running(&job.id, &message).await {
                    Ok(true) => {
                        warn!(job_id = %job.id, silent_secs = silent_for.num_seconds(), "job failed: telemetry silent past failure threshold");
                        failed += 1;
                    }
                    // Raced with a terminal update; nothing to do.
                    Ok(false) => {}
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "failed to mark stalled job");
                    }
                }
            } else {
                warn!(job_id = %job.id, silent_secs = silent_for.num_seconds(), "job stalled: no recent telemetry");
            }
        }

        Ok(failed)
    }
}

/// Error message stored on a job failed for silence.
pub fn stall_message(silent_secs: i64) -> String {
    format!("stalled for {}s without telemetry", silent_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_message_contains_stalled() {
        let message = stall_message(360);
        assert!(message.contains("stalled"));
        assert!(message.contains("360"));
    }

    #[test]
    fn test_default_thresholds() {
        let config = StaleConfig::default();
        assert_eq!(config.stale_threshold_secs, 60);
        assert_eq!(config.failed_threshold_secs, 300);
        assert_eq!(config.tick, Duration::from_secs(30));
    }
}
