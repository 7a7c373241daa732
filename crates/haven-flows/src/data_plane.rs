//! Local execution plane for backup starts.
//!
//! One backup start ties the storage and NBD subsystems together: the
//! repository engine creates the QCOW2 file and the pending job row, the
//! port allocator leases an export port, and the process manager spawns
//! `qemu-nbd` on it. The export is then handed to the external agent,
//! which streams blocks and pushes telemetry. When a job terminalises,
//! [`LocalDataPlane::cleanup_job`] tears the export down again, keeping
//! every allocated port backed by a tracked process.

use crate::error::{FlowError, FlowResult};
use haven_core::{ids, BackupType};
use haven_db::models::BackupDisk;
use haven_db::{BackupJobStore, Pool};
use haven_nbd::{NbdProcessManager, PortAllocator};
use haven_storage::engine::CreateBackupRequest;
use haven_storage::{ChainManager, RepositoryManager};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Request to start one per-disk backup locally.
#[derive(Debug, Clone)]
pub struct LocalBackupRequest {
    pub vm_context_id: String,
    pub vm_name: String,
    pub disk_index: i32,
    pub repository_id: String,
    pub total_bytes: i64,
    pub change_id: Option<String>,
    /// Cloud volume identity backing this disk, when known.
    pub volume_uuid: Option<String>,
}

/// A started backup export.
#[derive(Debug, Clone)]
pub struct LocalBackupStarted {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub nbd_port: u16,
    pub nbd_export_name: String,
    pub qcow2_path: String,
}

/// In-process data plane: backup creation plus NBD export lifecycle.
pub struct LocalDataPlane {
    repositories: Arc<RepositoryManager>,
    chains: Arc<ChainManager>,
    backups: BackupJobStore,
    ports: Arc<PortAllocator>,
    nbd: Arc<NbdProcessManager>,
}

impl LocalDataPlane {
    /// Create the execution plane over the shared collaborators.
    pub fn new(
        pool: Pool,
        repositories: Arc<RepositoryManager>,
        chains: Arc<ChainManager>,
        ports: Arc<PortAllocator>,
        nbd: Arc<NbdProcessManager>,
    ) -> Self {
        Self {
            repositories,
            chains,
            backups: BackupJobStore::new(&pool),
            ports,
            nbd,
        }
    }

    /// Start one per-disk backup: create the image and job row, lease a
    /// port, spawn the export. A failed spawn releases the port in the
    /// same call so no lease outlives its process.
    pub async fn start_backup(&self, request: LocalBackupRequest) -> FlowResult<LocalBackupStarted> {
        let engine = self.repositories.get(&request.repository_id).await?;

        // The chain anchor decides full vs incremental; the latest member
        // is the incremental's parent.
        let chain = self
            .chains
            .get_or_create(&request.vm_context_id, request.disk_index)
            .await?;
        let (backup_type, parent_backup_id) = if chain.full_backup_id.is_empty() {
            (BackupType::Full, None)
        } else {
            (BackupType::Incremental, Some(chain.latest_backup_id.clone()))
        };

        let job = engine
            .create_backup(CreateBackupRequest {
                vm_context_id: request.vm_context_id.clone(),
                vm_name: request.vm_name.clone(),
                disk_index: request.disk_index,
                backup_type,
                parent_backup_id,
                change_id: request.change_id.clone(),
                total_bytes: request.total_bytes,
            })
            .await?;

        let export_name = match &request.volume_uuid {
            Some(volume_uuid) => ids::volume_export_name(volume_uuid),
            None => ids::backup_export_name(&job.id, request.disk_index),
        };

        let port = self
            .ports
            .allocate(&job.id, &request.vm_name, &export_name)
            .await
            .map_err(|e| FlowError::Upstream {
                service: "nbd",
                message: e.to_string(),
            })?;

        if let Err(e) = self
            .nbd
            .start(
                port,
                &export_name,
                Path::new(&job.file_path),
                &job.id,
                &request.vm_name,
                request.disk_index,
            )
            .await
        {
            self.ports.release(port).await;
            if let Err(status) = self.backups.update_status(&job.id, "failed", Some(&e.to_string())).await {
                warn!(job_id = %job.id, error = %status, "failed to fail job after spawn error");
            }
            return Err(FlowError::Upstream {
                service: "nbd",
                message: e.to_string(),
            });
        }

        let disk = BackupDisk {
            job_id: job.id.clone(),
            disk_index: request.disk_index,
            volume_uuid: request.volume_uuid.clone(),
            bytes_transferred: 0,
            total_bytes: request.total_bytes,
            progress_percent: 0.0,
            status: "pending".to_string(),
        };
        if let Err(e) = self.backups.upsert_disk(&disk).await {
            warn!(job_id = %job.id, error = %e, "failed to record disk row");
        }

        info!(backup_id = %job.id, port, export = %export_name, "backup export started");
        Ok(LocalBackupStarted {
            backup_id: job.id,
            backup_type,
            nbd_port: port,
            nbd_export_name: export_name,
            qcow2_path: job.file_path,
        })
    }

    /// Tear down every export a job holds: stop the processes (which
    /// releases their ports) and sweep any leftover leases.
    pub async fn cleanup_job(&self, job_id: &str) -> FlowResult<usize> {
        let stopped = self
            .nbd
            .stop_by_job(job_id)
            .await
            .map_err(|e| FlowError::Upstream {
                service: "nbd",
                message: e.to_string(),
            })?;

        let swept = self.ports.release_by_job(job_id).await;
        if swept > 0 {
            warn!(job_id, swept, "released ports with no tracked process");
        }

        Ok(stopped)
    }

    /// Cancel a running job: stop its exports, release its ports, mark it
    /// cancelled.
    pub async fn cancel_job(&self, job_id: &str) -> FlowResult<()> {
        self.cleanup_job(job_id).await?;
        self.backups
            .update_status(job_id, "cancelled", Some("cancelled by operator"))
            .await?;
        info!(job_id, "job cancelled");
        Ok(())
    }
}
