//! Database models for the Haven control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One backup job: a single disk of a single VM in a single run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BackupJob {
    /// Semantic identifier: `backup-<vm>-disk<n>-<timestamp>`
    pub id: String,
    /// VM context this backup belongs to
    pub vm_context_id: String,
    /// VM display name
    pub vm_name: String,
    /// Disk index within the VM
    pub disk_index: i32,
    /// full | incremental | differential
    pub backup_type: String,
    /// pending | running | completed | failed | cancelled
    pub status: String,
    /// Parent backup id, non-empty iff incremental
    pub parent_backup_id: Option<String>,
    /// Hypervisor CBT token for the snapshot point
    pub change_id: Option<String>,
    /// Repository holding the backup file
    pub repository_id: String,
    /// Absolute path of the QCOW2 file
    pub file_path: String,
    /// Bytes written so far (actual size)
    pub size_bytes: i64,
    /// Total bytes expected
    pub total_bytes: i64,
    /// Bytes transferred per last telemetry
    pub bytes_transferred: i64,
    /// Progress per last telemetry
    pub progress_percent: f64,
    /// Transfer speed per last telemetry
    pub transfer_speed_bps: i64,
    /// ETA per last telemetry
    pub eta_seconds: i32,
    /// Current agent phase
    pub current_phase: String,
    /// Failure message when terminal-failed
    pub error_message: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
    /// Last telemetry arrival
    pub last_telemetry_at: Option<DateTime<Utc>>,
}

impl BackupJob {
    /// Whether the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed" | "cancelled")
    }
}

/// Per-disk progress row pushed by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BackupDisk {
    pub job_id: String,
    pub disk_index: i32,
    /// Identity of the underlying cloud volume, when known. Recovery
    /// derives the stable export name from it.
    pub volume_uuid: Option<String>,
    pub bytes_transferred: i64,
    pub total_bytes: i64,
    pub progress_percent: f64,
    pub status: String,
}

/// One chain per (VM context, disk): a full anchor plus its incrementals.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BackupChain {
    /// Semantic identifier: `chain-<vm_context>-disk<n>`
    pub id: String,
    pub vm_context_id: String,
    pub disk_index: i32,
    /// The chain's full anchor; empty for a fresh chain
    pub full_backup_id: String,
    /// Most recently added member
    pub latest_backup_id: String,
    pub total_backups: i32,
    pub total_size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Repository configuration row. The type-specific payload lives in
/// `config` as JSON (path/server/share/mount options etc).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Repository {
    pub id: String,
    pub name: String,
    /// local | nfs | cifs | s3 | azure
    pub repo_type: String,
    pub config: serde_json::Value,
    pub enabled: bool,
    pub is_immutable: bool,
    pub min_retention_days: i32,
    /// Days before the grace-period worker applies write protection
    pub grace_period_days: i32,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
    pub last_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// VM inventory row from discovery.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VmContext {
    pub id: String,
    pub vm_name: String,
    pub state: String,
    pub current_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Backup policy: a primary repository plus copy rules to secondaries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BackupPolicy {
    pub id: Uuid,
    pub name: String,
    pub primary_repository_id: String,
    pub retention_days: i32,
    pub created_at: DateTime<Utc>,
}

/// One copy rule within a policy.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CopyRule {
    pub id: Uuid,
    pub policy_id: Uuid,
    pub destination_repository_id: String,
    pub priority: i32,
    /// immediate | scheduled | manual
    pub mode: String,
    pub verify_after_copy: bool,
}

/// A replica of a finished backup at a secondary repository.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BackupCopy {
    pub id: Uuid,
    pub source_backup_id: String,
    pub destination_repository_id: String,
    pub file_path: String,
    pub size_bytes: i64,
    /// pending | copying | verifying | completed | failed
    pub status: String,
    /// pending | passed | failed
    pub verification_status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Cron schedule row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub timezone: String,
    pub schedule_type: String,
    pub enabled: bool,
    pub max_concurrent_jobs: i32,
    pub skip_if_running: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Machine group with an optional schedule attachment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MachineGroup {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub max_concurrent_vms: i32,
    pub schedule_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Group membership of one VM context.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GroupMembership {
    pub id: Uuid,
    pub group_id: Uuid,
    pub vm_context_id: String,
    pub priority: i32,
    pub enabled: bool,
}

/// One row per schedule trigger.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduleExecution {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub status: String,
    pub trigger_reason: Option<String>,
    pub jobs_created: i32,
    pub jobs_skipped: i32,
    pub jobs_failed: i32,
    /// Comma-joined VM context ids processed by this trigger
    pub vm_context_ids: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Named protection intent over a VM or group.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProtectionFlow {
    pub id: Uuid,
    pub name: String,
    /// backup | replication
    pub flow_type: String,
    /// vm | group
    pub target_type: String,
    pub target_id: String,
    pub repository_id: Option<String>,
    pub policy_id: Option<Uuid>,
    pub schedule_id: Option<Uuid>,
    pub enabled: bool,
    pub last_execution_id: Option<Uuid>,
    pub total_executions: i32,
    pub successful_executions: i32,
    pub failed_executions: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One run of a flow, fanning out to per-VM jobs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowExecution {
    pub id: Uuid,
    pub flow_id: Uuid,
    /// running | success | warning | error | cancelled
    pub status: String,
    /// manual | scheduled
    pub execution_type: String,
    /// Comma-joined backup job ids created by this execution
    pub created_job_ids: String,
    pub jobs_created: i32,
    pub jobs_completed: i32,
    pub jobs_failed: i32,
    pub jobs_skipped: i32,
    pub vms_processed: i32,
    pub bytes_transferred: i64,
    pub execution_time_seconds: i32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FlowExecution {
    /// Parse the compact job-id list.
    pub fn job_ids(&self) -> Vec<String> {
        split_id_list(&self.created_job_ids)
    }
}

/// Split a comma-joined id list, dropping empties.
pub fn split_id_list(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join ids into the compact comma-separated form.
pub fn join_id_list(ids: &[String]) -> String {
    ids.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_list_round_trip() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let joined = join_id_list(&ids);
        assert_eq!(joined, "a,b,c");
        assert_eq!(split_id_list(&joined), ids);
    }

    #[test]
    fn test_id_list_tolerates_blanks() {
        assert_eq!(split_id_list(""), Vec::<String>::new());
        assert_eq!(split_id_list("a,, b ,"), vec!["a", "b"]);
    }

    #[test]
    fn test_terminal_job() {
        let mut job = sample_job();
        assert!(!job.is_terminal());
        job.status = "completed".to_string();
        assert!(job.is_terminal());
        job.status = "cancelled".to_string();
        assert!(job.is_terminal());
    }

    fn sample_job() -> BackupJob {
        BackupJob {
            id: "backup-web01-disk0-20250101-000000".to_string(),
            vm_context_id: "ctx-web01".to_string(),
            vm_name: "web01".to_string(),
            disk_index: 0,
            backup_type: "full".to_string(),
            status: "running".to_string(),
            parent_backup_id: None,
            change_id: None,
            repository_id: "repo-local".to_string(),
            file_path: "/tmp/r/ctx-web01/disk-0/b.qcow2".to_string(),
            size_bytes: 0,
            total_bytes: 1 << 30,
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
}
