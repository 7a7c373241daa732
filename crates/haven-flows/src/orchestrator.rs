//! Flow orchestration.
//!
//! A protection flow is "protect this target according to this policy,
//! repository and schedule". Executing one fans out to a per-VM job via
//! the data plane; the execution then stays `running` until every created
//! job terminalises, at which point the shared maybe-complete routine
//! (driven by telemetry ingest and the execution monitor) closes it.

use crate::agent::{BackupStartRequest, DataPlaneClient};
use crate::error::{FlowError, FlowResult};
use chrono::Utc;
use haven_core::{ExecutionStatus, ExecutionType, FlowType, TargetType};
use haven_db::models::{join_id_list, FlowExecution, ProtectionFlow};
use haven_db::{BackupJobStore, FlowStore, Pool, ScheduleStore, VmContextStore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Orchestrates protection flows over VMs and groups.
pub struct FlowOrchestrator {
    flows: FlowStore,
    backups: BackupJobStore,
    schedules: ScheduleStore,
    vm_contexts: VmContextStore,
    data_plane: DataPlaneClient,
}

impl FlowOrchestrator {
    /// Create an orchestrator over the shared pool.
    pub fn new(pool: Pool, data_plane: DataPlaneClient) -> Self {
        Self {
            flows: FlowStore::new(&pool),
            backups: BackupJobStore::new(&pool),
            schedules: ScheduleStore::new(&pool),
            vm_contexts: VmContextStore::new(&pool),
            data_plane,
        }
    }

    /// Execute a flow now. Returns the execution row, which remains
    /// `running` while created jobs are in flight.
    pub async fn execute_flow(
        &self,
        flow_id: Uuid,
        execution_type: ExecutionType,
    ) -> FlowResult<FlowExecution> {
        let flow = self
            .flows
            .get_flow(flow_id)
            .await
            .map_err(|e| match e {
                haven_db::DbError::NotFound(_) => FlowError::FlowNotFound(flow_id.to_string()),
                other => other.into(),
            })?;

        if !flow.enabled {
            return Err(FlowError::FlowDisabled(flow.name.clone()));
        }

        let mut execution = FlowExecution {
            id: Uuid::new_v4(),
            flow_id: flow.id,
            status: ExecutionStatus::Running.as_str().to_string(),
            execution_type: execution_type.as_str().to_string(),
            created_job_ids: String::new(),
            jobs_created: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            jobs_skipped: 0,
            vms_processed: 0,
            bytes_transferred: 0,
            execution_time_seconds: 0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.flows.insert_execution(&execution).await?;

        info!(flow_id = %flow.id, execution_id = %execution.id, flow_type = %flow.flow_type, "flow execution started");

        let flow_type: FlowType = flow
            .flow_type
            .parse()
            .map_err(FlowError::Validation)?;
        match flow_type {
            FlowType::Backup => self.process_protection_flow(&flow, &mut execution, false).await?,
            FlowType::Replication => {
                self.process_protection_flow(&flow, &mut execution, true).await?
            }
        }

        Ok(self.flows.get_execution(execution.id).await?)
    }

    /// Fan out one job per target VM. The execution is left `running`;
    /// only all-creations-failed closes it here, as `error`.
    async fn process_protection_flow(
        &self,
        flow: &ProtectionFlow,
        execution: &mut FlowExecution,
        replication: bool,
    ) -> FlowResult<()> {
        // Backup flows need a target repository; replication destinations
        // belong to the volume service.
        let repository_id = match (replication, flow.repository_id.as_deref()) {
            (false, None) => {
                return Err(FlowError::Validation(format!(
                    "flow {} has no target repository",
                    flow.name
                )))
            }
            (_, repo) => repo,
        };

        let targets = self.resolve_targets(flow).await?;
        if targets.is_empty() {
            return Err(FlowError::NoTargets(flow.name.clone()));
        }

        let mut created_ids: Vec<String> = Vec::new();
        let mut creation_failures = 0;

        for vm_context_id in &targets {
            execution.vms_processed += 1;

            match self
                .start_job_for_vm(flow, repository_id, vm_context_id, replication)
                .await
            {
                Ok(backup_id) => {
                    if let Err(e) = self
                        .vm_contexts
                        .set_current_job(vm_context_id, &backup_id)
                        .await
                    {
                        warn!(vm_context_id, error = %e, "failed to set current job pointer");
                    }
                    created_ids.push(backup_id);
                    execution.jobs_created += 1;
                }
                Err(e) => {
                    warn!(vm_context_id, flow = %flow.name, error = %e, "job creation failed");
                    creation_failures += 1;
                }
            }
        }

        execution.created_job_ids = join_id_list(&created_ids);
        self.flows.update_execution_progress(execution).await?;

        if execution.jobs_created == 0 && creation_failures > 0 {
            // Nothing is in flight; the execution can only be an error.
            let elapsed = (Utc::now() - execution.started_at).num_seconds() as i32;
            let transitioned = self
                .flows
                .complete_if_running(
                    execution.id,
                    ExecutionStatus::Error.as_str(),
                    0,
                    creation_failures,
                    0,
                    elapsed,
                )
                .await?;
            if transitioned {
                self.flows
                    .record_flow_result(flow.id, execution.id, ExecutionStatus::Error.as_str())
                    .await?;
            }
        }

        Ok(())
    }

    async fn start_job_for_vm(
        &self,
        flow: &ProtectionFlow,
        repository_id: Option<&str>,
        vm_context_id: &str,
        replication: bool,
    ) -> FlowResult<String> {
        let vm = self.vm_contexts.get(vm_context_id).await?;

        // A completed full in the target repository makes this run
        // incremental; otherwise the chain starts fresh. Replication
        // without a repository always ships deltas.
        let backup_type = match repository_id {
            Some(repository_id) => {
                if self
                    .backups
                    .has_completed_full(vm_context_id, repository_id)
                    .await?
                {
                    "incremental"
                } else {
                    "full"
                }
            }
            None => "incremental",
        };

        let request = BackupStartRequest {
            vm_name: vm.vm_name.clone(),
            backup_type: backup_type.to_string(),
            repository_id: repository_id.map(str::to_string),
            policy_id: flow.policy_id.map(|id| id.to_string()),
            tags: Vec::new(),
        };

        let response = if replication {
            self.data_plane.start_replication(&request).await?
        } else {
            self.data_plane.start_backup(&request).await?
        };

        debug!(vm_context_id, backup_id = %response.backup_id, backup_type, "job dispatched");
        Ok(response.backup_id)
    }

    /// Dispatch one backup job for a VM, outside any flow execution. Used
    /// by the scheduler when a group tick fans out to members.
    pub async fn create_backup_job(
        &self,
        vm_context_id: &str,
        repository_id: &str,
        policy_id: Option<Uuid>,
    ) -> FlowResult<String> {
        let vm = self.vm_contexts.get(vm_context_id).await?;
        let backup_type = if self
            .backups
            .has_completed_full(vm_context_id, repository_id)
            .await?
        {
            "incremental"
        } else {
            "full"
        };

        let request = BackupStartRequest {
            vm_name: vm.vm_name.clone(),
            backup_type: backup_type.to_string(),
            repository_id: Some(repository_id.to_string()),
            policy_id: policy_id.map(|id| id.to_string()),
            tags: Vec::new(),
        };

        let response = self.data_plane.start_backup(&request).await?;
        self.vm_contexts
            .set_current_job(vm_context_id, &response.backup_id)
            .await?;
        Ok(response.backup_id)
    }

    /// Dispatch one replication job for a VM. The destination volumes are
    /// the volume service's concern, so no repository travels with it.
    pub async fn create_replication_job(&self, vm_context_id: &str) -> FlowResult<String> {
        let vm = self.vm_contexts.get(vm_context_id).await?;

        let request = BackupStartRequest {
            vm_name: vm.vm_name.clone(),
            backup_type: "incremental".to_string(),
            repository_id: None,
            policy_id: None,
            tags: Vec::new(),
        };

        let response = self.data_plane.start_replication(&request).await?;
        self.vm_contexts
            .set_current_job(vm_context_id, &response.backup_id)
            .await?;
        Ok(response.backup_id)
    }

    /// Resolve the flow target to VM context ids: the single VM, or every
    /// enabled member of the group ordered by priority.
    async fn resolve_targets(&self, flow: &ProtectionFlow) -> FlowResult<Vec<String>> {
        let target_type: TargetType = flow
            .target_type
            .parse()
            .map_err(FlowError::Validation)?;

        match target_type {
            TargetType::Vm => Ok(vec![flow.target_id.clone()]),
            TargetType::Group => {
                let group_id: Uuid = flow.target_id.parse().map_err(|_| {
                    FlowError::Validation(format!("flow {} has a malformed group id", flow.name))
                })?;
                let memberships = self.schedules.enabled_memberships(group_id).await?;
                Ok(memberships
                    .into_iter()
                    .map(|m| m.vm_context_id)
                    .collect())
            }
        }
    }

    /// Shared maybe-complete routine, invoked by telemetry ingest and the
    /// execution monitor. A no-op while any created job is non-terminal;
    /// a one-shot transition once all are.
    pub async fn maybe_complete_execution(&self, execution: &FlowExecution) -> FlowResult<bool> {
        let job_ids = execution.job_ids();
        if job_ids.is_empty() {
            return Ok(false);
        }

        let mut completed = 0;
        let mut failed = 0;
        let mut bytes = 0i64;

        for job_id in &job_ids {
            let Some(job) = self.backups.find(job_id).await? else {
                // A deleted job cannot complete; count it failed.
                failed += 1;
                continue;
            };

            match job.status.as_str() {
                "completed" => {
                    completed += 1;
                    bytes += job.bytes_transferred;
                }
                "failed" | "cancelled" => failed += 1,
                _ => {}
            }
        }

        if completed + failed < job_ids.len() as i32 {
            return Ok(false);
        }

        let final_status = final_execution_status(completed, failed);
        let elapsed = (Utc::now() - execution.started_at).num_seconds() as i32;

        let transitioned = self
            .flows
            .complete_if_running(
                execution.id,
                final_status.as_str(),
                completed,
                failed,
                bytes,
                elapsed,
            )
            .await?;

        if transitioned {
            self.flows
                .record_flow_result(execution.flow_id, execution.id, final_status.as_str())
                .await?;
            info!(execution_id = %execution.id, status = %final_status, completed, failed, "flow execution closed");
        }

        Ok(transitioned)
    }
}

/// Final status once every job is terminal: `success` iff none failed,
/// `error` iff none completed, `warning` for a mix.
pub fn final_execution_status(completed: i32, failed: i32) -> ExecutionStatus {
    if failed == 0 {
        ExecutionStatus::Success
    } else if completed == 0 {
        ExecutionStatus::Error
    } else {
        ExecutionStatus::Warning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_status_success() {
        assert_eq!(final_execution_status(3, 0), ExecutionStatus::Success);
    }

    #[test]
    fn test_final_status_error() {
        assert_eq!(final_execution_status(0, 2), ExecutionStatus::Error);
    }

    #[test]
    fn test_final_status_warning_on_mix() {
        assert_eq!(final_execution_status(1, 1), ExecutionStatus::Warning);
        assert_eq!(final_execution_status(5, 1), ExecutionStatus::Warning);
    }
}
