//! Telemetry ingest.
//!
//! Agents push updates keyed by job id. Merging is sparse: numeric fields
//! only overwrite when non-zero, so a terminal update with a zeroed body
//! cannot blank good progress. Updates for one job race freely; the merge
//! makes them commutative for non-zero fields and the terminal transition
//! is conditional, so replaying an update is a no-op.

use crate::agent::TelemetryUpdate;
use crate::data_plane::LocalDataPlane;
use crate::error::{FlowError, FlowResult};
use crate::orchestrator::FlowOrchestrator;
use chrono::{DateTime, Utc};
use haven_core::ids;
use haven_db::models::{BackupDisk, BackupJob};
use haven_db::{BackupJobStore, FlowStore, Pool};
use haven_storage::{ChainManager, CopyEngine};
use std::sync::Arc;
use tracing::{debug, warn};

/// Accepts pushed agent updates and rolls terminal events up into flow
/// executions.
pub struct TelemetryIngest {
    backups: BackupJobStore,
    flows: FlowStore,
    orchestrator: Arc<FlowOrchestrator>,
    chains: Arc<ChainManager>,
    copies: Option<Arc<CopyEngine>>,
    data_plane: Option<Arc<LocalDataPlane>>,
}

impl TelemetryIngest {
    /// Create an ingest front over the shared pool. When a copy engine is
    /// supplied, completed backups queue their policy copies; when a data
    /// plane is supplied, terminal jobs get their exports torn down.
    pub fn new(
        pool: Pool,
        orchestrator: Arc<FlowOrchestrator>,
        chains: Arc<ChainManager>,
        copies: Option<Arc<CopyEngine>>,
        data_plane: Option<Arc<LocalDataPlane>>,
    ) -> Self {
        Self {
            backups: BackupJobStore::new(&pool),
            flows: FlowStore::new(&pool),
            orchestrator,
            chains,
            copies,
            data_plane,
        }
    }

    /// Apply one pushed update.
    pub async fn ingest(&self, update: TelemetryUpdate) -> FlowResult<()> {
        let mut job = self
            .backups
            .find(&update.job_id)
            .await?
            .ok_or_else(|| FlowError::Validation(format!("unknown job {}", update.job_id)))?;

        apply_update(&mut job, &update, Utc::now());
        self.backups.update_progress(&job).await?;

        // Per-disk rows update independently; partial failure is acceptable.
        for disk in &update.disks {
            let row = BackupDisk {
                job_id: job.id.clone(),
                disk_index: disk.disk_index,
                volume_uuid: None,
                bytes_transferred: disk.bytes_transferred,
                total_bytes: disk.total_bytes,
                progress_percent: disk.progress_percent,
                status: disk.status.clone(),
            };
            if let Err(e) = self.backups.upsert_disk(&row).await {
                warn!(job_id = %job.id, disk_index = disk.disk_index, error = %e, "disk telemetry update failed");
            }
        }

        if job.is_terminal() {
            if let Some(data_plane) = &self.data_plane {
                if let Err(e) = data_plane.cleanup_job(&job.id).await {
                    warn!(job_id = %job.id, error = %e, "export teardown failed");
                }
            }

            // The member's size only became final with this update; bring
            // the chain counters back in line with the member rows.
            if job.status == "completed" {
                let chain_id = ids::chain_id(&job.vm_context_id, job.disk_index);
                if let Err(e) = self.chains.sync_member_sizes(&chain_id).await {
                    warn!(job_id = %job.id, chain_id = %chain_id, error = %e, "chain size resync failed");
                }
            }

            self.rollup(&job).await;
        }

        Ok(())
    }

    /// Terminal event: close any running execution that created this job,
    /// and queue policy copies for completed backups.
    async fn rollup(&self, job: &BackupJob) {
        let executions = match self.flows.list_running_executions().await {
            Ok(executions) => executions,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to list running executions for rollup");
                return;
            }
        };

        for execution in executions {
            if !execution.job_ids().iter().any(|id| id == &job.id) {
                continue;
            }

            if let Err(e) = self.orchestrator.maybe_complete_execution(&execution).await {
                warn!(execution_id = %execution.id, error = %e, "execution rollup failed");
                continue;
            }

            if job.status == "completed" {
                self.queue_policy_copies(execution.flow_id, job).await;
            }
        }
    }

    async fn queue_policy_copies(&self, flow_id: uuid::Uuid, job: &BackupJob) {
        let Some(copies) = &self.copies else {
            return;
        };

        let flow = match self.flows.get_flow(flow_id).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!(flow_id = %flow_id, error = %e, "failed to load flow for copy planning");
                return;
            }
        };

        if let Some(policy_id) = flow.policy_id {
            match copies.enqueue_for_policy(policy_id, job).await {
                Ok(queued) if queued > 0 => {
                    debug!(job_id = %job.id, queued, "queued policy copies");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to queue policy copies");
                }
            }
        }
    }
}

/// Sparse-merge one update into a job row.
///
/// Rules: always stamp telemetry arrival; numeric fields overwrite only if
/// non-zero; `current_phase` overwrites if non-empty; a non-running status
/// overrides the stored one (completed stamps `completed_at` once); an
/// error payload forces `failed`.
pub fn apply_update(job: &mut BackupJob, update: &TelemetryUpdate, now: DateTime<Utc>) {
    job.last_telemetry_at = Some(now);

    if update.bytes_transferred != 0 {
        job.bytes_transferred = update.bytes_transferred;
        // Bytes on disk track bytes moved for block streams.
        job.size_bytes = update.bytes_transferred;
    }
    if update.total_bytes != 0 {
        job.total_bytes = update.total_bytes;
    }
    if update.transfer_speed_bps != 0 {
        job.transfer_speed_bps = update.transfer_speed_bps;
    }
    if update.eta_seconds != 0 {
        job.eta_seconds = update.eta_seconds;
    }
    if update.progress_percent != 0.0 {
        job.progress_percent = update.progress_percent;
    }
    if !update.current_phase.is_empty() {
        job.current_phase = update.current_phase.clone();
    }

    match update.status.as_str() {
        "" => {
            // First telemetry moves a pending job to running.
            if job.status == "pending" {
                job.status = "running".to_string();
            }
        }
        "running" => {
            if !job.is_terminal() {
                job.status = "running".to_string();
            }
        }
        other => {
            job.status = other.to_string();
            if other == "completed" && job.completed_at.is_none() {
                job.completed_at = Some(now);
            }
        }
    }

    if let Some(error) = &update.error {
        job.status = "failed".to_string();
        job.error_message = Some(error.message.clone());
        if job.completed_at.is_none() {
            job.completed_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::TelemetryError;

    fn running_job() -> BackupJob {
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
            progress_percent: 0.0,
            transfer_speed_bps: 0,
            eta_seconds: 0,
            current_phase: String::new(),
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
            last_telemetry_at: None,
        }
    }

    fn update(job_id: &str) -> TelemetryUpdate {
        TelemetryUpdate {
            job_id: job_id.to_string(),
            job_type: "backup".to_string(),
            status: String::new(),
            current_phase: String::new(),
            bytes_transferred: 0,
            total_bytes: 0,
            transfer_speed_bps: 0,
            eta_seconds: 0,
            progress_percent: 0.0,
            disks: vec![],
            error: None,
            timestamp: None,
        }
    }

    #[test]
    fn test_zeroed_terminal_update_keeps_progress() {
        let mut job = running_job();
        let now = Utc::now();

        let mut progress = update(&job.id);
        progress.bytes_transferred = 500;
        progress.progress_percent = 50.0;
        progress.current_phase = "copy".to_string();
        apply_update(&mut job, &progress, now);

        let mut terminal = update(&job.id);
        terminal.status = "completed".to_string();
        apply_update(&mut job, &terminal, now);

        assert_eq!(job.status, "completed");
        assert_eq!(job.bytes_transferred, 500);
        assert!((job.progress_percent - 50.0).abs() < f64::EPSILON);
        assert_eq!(job.current_phase, "copy");
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_first_telemetry_moves_pending_to_running() {
        let mut job = running_job();
        job.status = "pending".to_string();

        let first_update = update(&job.id);
        apply_update(&mut job, &first_update, Utc::now());
        assert_eq!(job.status, "running");
        assert!(job.last_telemetry_at.is_some());
    }

    #[test]
    fn test_error_payload_forces_failed() {
        let mut job = running_job();
        let mut u = update(&job.id);
        u.error = Some(TelemetryError {
            message: "nbd write failed".to_string(),
            code: None,
            timestamp: None,
        });

        apply_update(&mut job, &u, Utc::now());
        assert_eq!(job.status, "failed");
        assert_eq!(job.error_message.as_deref(), Some("nbd write failed"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut job = running_job();
        let now = Utc::now();

        let mut u = update(&job.id);
        u.status = "completed".to_string();
        u.bytes_transferred = 1000;
        u.progress_percent = 100.0;

        apply_update(&mut job, &u, now);
        let first = serde_json::to_value(&job).unwrap();

        apply_update(&mut job, &u, now);
        let second = serde_json::to_value(&job).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_completed_at_not_overwritten_on_replay() {
        let mut job = running_job();
        let t1 = Utc::now();

        let mut u = update(&job.id);
        u.status = "completed".to_string();
        apply_update(&mut job, &u, t1);
        let stamped = job.completed_at;

        let t2 = t1 + chrono::Duration::seconds(30);
        apply_update(&mut job, &u, t2);
        assert_eq!(job.completed_at, stamped);
        assert_eq!(job.last_telemetry_at, Some(t2));
    }

    #[test]
    fn test_running_status_cannot_resurrect_terminal_job() {
        let mut job = running_job();
        job.status = "completed".to_string();

        let mut u = update(&job.id);
        u.status = "running".to_string();
        apply_update(&mut job, &u, Utc::now());

        assert_eq!(job.status, "completed");
    }

    #[test]
    fn test_completed_job_size_flows_into_chain_totals() {
        // A freshly created backup row carries size zero; the real byte
        // count arrives through telemetry. Once the terminal update lands,
        // the chain counters derived from the member rows must reflect it.
        let mut job = running_job();
        job.status = "pending".to_string();
        job.size_bytes = 0;
        let now = Utc::now();

        let mut progress = update(&job.id);
        progress.bytes_transferred = 1_073_741_824;
        progress.progress_percent = 100.0;
        apply_update(&mut job, &progress, now);

        let mut terminal = update(&job.id);
        terminal.status = "completed".to_string();
        apply_update(&mut job, &terminal, now);

        assert_eq!(job.status, "completed");
        assert_eq!(job.size_bytes, 1_073_741_824);

        let (total_backups, total_size_bytes) =
            haven_storage::chain::chain_totals(std::slice::from_ref(&job));
        assert_eq!(total_backups, 1);
        assert_eq!(total_size_bytes, job.size_bytes);
        assert!(total_size_bytes > 0, "completed member must contribute its size");
    }

    #[test]
    fn test_nonzero_fields_overwrite() {
        let mut job = running_job();
        let mut u = update(&job.id);
        u.bytes_transferred = 123;
        u.total_bytes = 2000;
        u.transfer_speed_bps = 99;
        u.eta_seconds = 7;

        apply_update(&mut job, &u, Utc::now());
        assert_eq!(job.bytes_transferred, 123);
        assert_eq!(job.size_bytes, 123);
        assert_eq!(job.total_bytes, 2000);
        assert_eq!(job.transfer_speed_bps, 99);
        assert_eq!(job.eta_seconds, 7);
    }
}
