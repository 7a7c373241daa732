//! Startup job recovery.
//!
//! After a restart, the database may claim jobs are running that the data
//! plane finished, lost or never saw. For each non-terminal job, ask the
//! agent what it sees under the job's export names and reconcile.
//!
//! Export-name resolution precedes job-id lookup: the stable
//! `migration-vol-<volume-uuid>` names derived from the job's disks are
//! tried first, then the raw job id.

use crate::agent::{AgentClient, AgentJobState, AgentProgress};
use crate::error::{FlowError, FlowResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use haven_core::ids;
use haven_db::models::{BackupDisk, BackupJob};
use haven_db::{BackupJobStore, Pool, VmContextStore};
use haven_nbd::{discover_running, PortAllocation, PortAllocator};
use std::path::Path;
use tracing::{info, warn};

/// What recovery decided for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Agent still runs it: refresh progress and keep watching.
    RefreshProgress,
    /// Mark completed and set the VM context ready.
    MarkCompleted,
    /// Mark failed with the given reason; clear the VM's current job.
    MarkFailed(String),
    /// Leave it for the stale-job detector.
    Leave,
}

/// Aggregate results of a recovery pass.
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    pub examined: usize,
    pub refreshed: usize,
    pub completed: usize,
    pub failed: usize,
    pub left: usize,
}

/// Reconciles non-terminal jobs against the agent's view of the world.
pub struct JobRecovery {
    backups: BackupJobStore,
    vm_contexts: VmContextStore,
    agent: AgentClient,
    max_job_age: ChronoDuration,
}

impl JobRecovery {
    /// Create a recovery pass with the given stagnation cutoff.
    pub fn new(pool: Pool, agent: AgentClient, max_job_age_secs: i64) -> Self {
        Self {
            backups: BackupJobStore::new(&pool),
            vm_contexts: VmContextStore::new(&pool),
            agent,
            max_job_age: ChronoDuration::seconds(max_job_age_secs),
        }
    }

    /// Re-register ports still served by qemu-nbd processes from a prior
    /// process lifetime. The allocator holds no persistent state, so
    /// without this a restart could lease a port a surviving export is
    /// bound to. Runs before any worker starts. Returns the count adopted.
    pub async fn adopt_surviving_exports(
        &self,
        nbd_binary: &Path,
        ports: &PortAllocator,
    ) -> FlowResult<usize> {
        let survivors = discover_running(nbd_binary).map_err(|e| FlowError::Upstream {
            service: "nbd",
            message: format!("process scan failed: {}", e),
        })?;

        let mut adopted = 0;
        for export in survivors {
            let (job_id, vm_name) = self.resolve_export_owner(&export.export_name).await;

            let allocation = PortAllocation {
                port: export.port,
                job_id,
                vm_name,
                export_name: export.export_name.clone(),
                allocated_at: Utc::now(),
            };

            match ports.adopt(allocation).await {
                Ok(()) => {
                    info!(
                        port = export.port,
                        pid = export.pid,
                        export = %export.export_name,
                        "adopted surviving NBD export"
                    );
                    adopted += 1;
                }
                Err(e) => {
                    warn!(port = export.port, error = %e, "failed to adopt surviving export");
                }
            }
        }

        Ok(adopted)
    }

    /// Owning job and VM of an export, resolved from the export name:
    /// the stable volume form through the disk rows, the backup form by
    /// the job id it encodes. Unresolvable exports keep their name as the
    /// owner so by-job release still finds them.
    async fn resolve_export_owner(&self, export_name: &str) -> (String, String) {
        let job = if let Some(volume_uuid) = ids::volume_uuid_from_export_name(export_name) {
            self.backups
                .find_non_terminal_by_volume(volume_uuid)
                .await
                .unwrap_or_default()
        } else if let Some(job_id) = ids::job_id_from_export_name(export_name) {
            self.backups.find(job_id).await.unwrap_or_default()
        } else {
            None
        };

        match job {
            Some(job) => (job.id, job.vm_name),
            None => (export_name.to_string(), String::new()),
        }
    }

    /// Run recovery over every job not in a terminal state.
    pub async fn run(&self) -> FlowResult<RecoveryReport> {
        let jobs = self.backups.list_non_terminal().await?;
        let mut report = RecoveryReport::default();

        for job in jobs {
            report.examined += 1;

            let disks = self.backups.get_disks(&job.id).await.unwrap_or_default();
            let progress = self.probe_agent(&job, &disks).await;
            let decision = decide(&job, progress.as_ref(), Utc::now(), self.max_job_age);

            match &decision {
                RecoveryDecision::RefreshProgress => {
                    if let Some(p) = progress {
                        self.refresh_progress(&job, &p).await;
                    }
                    report.refreshed += 1;
                }
                RecoveryDecision::MarkCompleted => {
                    if let Err(e) = self.backups.update_status(&job.id, "completed", None).await {
                        warn!(job_id = %job.id, error = %e, "failed to mark job completed");
                        continue;
                    }
                    if let Err(e) = self.vm_contexts.set_state(&job.vm_context_id, "ready").await {
                        warn!(vm_context_id = %job.vm_context_id, error = %e, "failed to mark VM ready");
                    }
                    report.completed += 1;
                }
                RecoveryDecision::MarkFailed(reason) => {
                    if let Err(e) = self
                        .backups
                        .update_status(&job.id, "failed", Some(reason))
                        .await
                    {
                        warn!(job_id = %job.id, error = %e, "failed to mark job failed");
                        continue;
                    }
                    if let Err(e) = self.vm_contexts.clear_current_job(&job.vm_context_id).await {
                        warn!(vm_context_id = %job.vm_context_id, error = %e, "failed to clear current job");
                    }
                    report.failed += 1;
                }
                RecoveryDecision::Leave => {
                    report.left += 1;
                }
            }

            info!(job_id = %job.id, decision = ?decision, "recovery decision");
        }

        Ok(report)
    }

    /// Query the agent under each candidate name, first hit wins. `None`
    /// means the agent was unreachable for every candidate.
    async fn probe_agent(&self, job: &BackupJob, disks: &[BackupDisk]) -> Option<AgentProgress> {
        for name in export_candidates(job, disks) {
            match self.agent.get_progress(&name).await {
                Ok(progress) if progress.state != AgentJobState::NotFound => {
                    return Some(progress);
                }
                Ok(not_found) => {
                    // Remember the definite not-found unless a later
                    // candidate resolves.
                    if name == job.id {
                        return Some(not_found);
                    }
                }
                Err(e) => {
                    warn!(job_id = %job.id, name, error = %e, "agent unreachable");
                    return None;
                }
            }
        }

        Some(AgentProgress {
            state: AgentJobState::NotFound,
            progress_percent: 0.0,
            bytes_transferred: 0,
            total_bytes: 0,
            error: None,
        })
    }

    async fn refresh_progress(&self, job: &BackupJob, progress: &AgentProgress) {
        let mut refreshed = job.clone();
        refreshed.status = "running".to_string();
        if progress.bytes_transferred != 0 {
            refreshed.bytes_transferred = progress.bytes_transferred;
        }
        if progress.total_bytes != 0 {
            refreshed.total_bytes = progress.total_bytes;
        }
        if progress.progress_percent != 0.0 {
            refreshed.progress_percent = progress.progress_percent;
        }
        refreshed.last_telemetry_at = Some(Utc::now());

        if let Err(e) = self.backups.update_progress(&refreshed).await {
            warn!(job_id = %job.id, error = %e, "failed to refresh recovered job");
        }
    }
}

/// Candidate logical names for a job, volume-derived names first.
pub fn export_candidates(job: &BackupJob, disks: &[BackupDisk]) -> Vec<String> {
    let mut candidates: Vec<String> = disks
        .iter()
        .filter_map(|d| d.volume_uuid.as_deref())
        .map(ids::volume_export_name)
        .collect();
    candidates.push(job.id.clone());
    candidates
}

/// The recovery decision table.
///
/// `progress = None` means the agent was unreachable; the job is failed
/// only once it has been stagnant longer than `max_job_age`, otherwise it
/// is left for the stale-job detector.
pub fn decide(
    job: &BackupJob,
    progress: Option<&AgentProgress>,
    now: DateTime<Utc>,
    max_job_age: ChronoDuration,
) -> RecoveryDecision {
    match progress {
        Some(p) => match p.state {
            AgentJobState::Running => RecoveryDecision::RefreshProgress,
            AgentJobState::Completed => RecoveryDecision::MarkCompleted,
            AgentJobState::Failed => RecoveryDecision::MarkFailed(
                p.error
                    .clone()
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            ),
            AgentJobState::NotFound => {
                if job.progress_percent >= 90.0 {
                    RecoveryDecision::MarkCompleted
                } else {
                    RecoveryDecision::MarkFailed(format!(
                        "job lost by agent at {:.1}% progress",
                        job.progress_percent
                    ))
                }
            }
        },
        None => {
            let last_seen = job.last_telemetry_at.unwrap_or(job.created_at);
            if now - last_seen > max_job_age {
                RecoveryDecision::MarkFailed(format!(
                    "agent unreachable and job stagnant for {}s",
                    (now - last_seen).num_seconds()
                ))
            } else {
                RecoveryDecision::Leave
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(progress: f64, last_telemetry_mins_ago: i64) -> BackupJob {
        let now = Utc::now();
        BackupJob {
            id: "backup-web01-disk0-20250101-000000".to_string(),
            vm_context_id: "ctx-web01".to_string(),
            vm_name: "web01".to_string(),
            disk_index: 0,
            backup_type: "full".to_string(),
            status: "running".to_string(),
            parent_backup_id: None,
            change_id: None,
            repository_id: "repo".to_string(),
            file_path: String::new(),
            size_bytes: 0,
            total_bytes: 1000,
            bytes_transferred: 0,
            progress_percent: progress,
            transfer_speed_bps: 0,
            eta_seconds: 0,
            current_phase: String::new(),
            error_message: None,
            created_at: now - ChronoDuration::hours(2),
            completed_at: None,
            last_telemetry_at: Some(now - ChronoDuration::minutes(last_telemetry_mins_ago)),
        }
    }

    fn agent(state: AgentJobState) -> AgentProgress {
        AgentProgress {
            state,
            progress_percent: 0.0,
            bytes_transferred: 0,
            total_bytes: 0,
            error: None,
        }
    }

    #[test]
    fn test_running_refreshes() {
        let decision = decide(
            &job(40.0, 1),
            Some(&agent(AgentJobState::Running)),
            Utc::now(),
            ChronoDuration::minutes(30),
        );
        assert_eq!(decision, RecoveryDecision::RefreshProgress);
    }

    #[test]
    fn test_completed_marks_completed() {
        let decision = decide(
            &job(100.0, 1),
            Some(&agent(AgentJobState::Completed)),
            Utc::now(),
            ChronoDuration::minutes(30),
        );
        assert_eq!(decision, RecoveryDecision::MarkCompleted);
    }

    #[test]
    fn test_not_found_above_ninety_percent_completes() {
        let decision = decide(
            &job(93.5, 1),
            Some(&agent(AgentJobState::NotFound)),
            Utc::now(),
            ChronoDuration::minutes(30),
        );
        assert_eq!(decision, RecoveryDecision::MarkCompleted);
    }

    #[test]
    fn test_not_found_below_ninety_percent_fails_as_lost() {
        let decision = decide(
            &job(42.0, 1),
            Some(&agent(AgentJobState::NotFound)),
            Utc::now(),
            ChronoDuration::minutes(30),
        );
        match decision {
            RecoveryDecision::MarkFailed(reason) => assert!(reason.contains("lost")),
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_agent_failure_propagates_error() {
        let mut p = agent(AgentJobState::Failed);
        p.error = Some("snapshot vanished".to_string());
        let decision = decide(&job(10.0, 1), Some(&p), Utc::now(), ChronoDuration::minutes(30));
        assert_eq!(
            decision,
            RecoveryDecision::MarkFailed("snapshot vanished".to_string())
        );
    }

    #[test]
    fn test_unreachable_fresh_job_is_left_alone() {
        let decision = decide(&job(10.0, 5), None, Utc::now(), ChronoDuration::minutes(30));
        assert_eq!(decision, RecoveryDecision::Leave);
    }

    #[test]
    fn test_unreachable_stagnant_job_fails() {
        let decision = decide(&job(10.0, 45), None, Utc::now(), ChronoDuration::minutes(30));
        assert!(matches!(decision, RecoveryDecision::MarkFailed(_)));
    }

    #[test]
    fn test_export_candidates_prefer_volume_names() {
        let disks = vec![
            BackupDisk {
                job_id: "j".to_string(),
                disk_index: 0,
                volume_uuid: Some("6a1c".to_string()),
                bytes_transferred: 0,
                total_bytes: 0,
                progress_percent: 0.0,
                status: "running".to_string(),
            },
            BackupDisk {
                job_id: "j".to_string(),
                disk_index: 1,
                volume_uuid: None,
                bytes_transferred: 0,
                total_bytes: 0,
                progress_percent: 0.0,
                status: "running".to_string(),
            },
        ];

        let candidates = export_candidates(&job(0.0, 1), &disks);
        assert_eq!(candidates[0], "migration-vol-6a1c");
        assert_eq!(
            candidates.last().unwrap(),
            "backup-web01-disk0-20250101-000000"
        );
    }
}
