//! Backup job and per-disk progress queries.

use crate::error::{DbError, DbResult};
use crate::models::{BackupDisk, BackupJob};
use crate::pool::Pool;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};

/// Store for `backup_jobs` and `backup_disks`.
pub struct BackupJobStore {
    pool: PgPool,
}

impl BackupJobStore {
    /// Create a new store.
    pub fn new(pool: &Pool) -> Self {
        Self {
            pool: pool.inner().clone(),
        }
    }

    /// Insert a freshly created backup job row.
    pub async fn create(&self, job: &BackupJob) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_jobs (
                id, vm_context_id, vm_name, disk_index, backup_type, status,
                parent_backup_id, change_id, repository_id, file_path,
                size_bytes, total_bytes, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&job.id)
        .bind(&job.vm_context_id)
        .bind(&job.vm_name)
        .bind(job.disk_index)
        .bind(&job.backup_type)
        .bind(&job.status)
        .bind(&job.parent_backup_id)
        .bind(&job.change_id)
        .bind(&job.repository_id)
        .bind(&job.file_path)
        .bind(job.size_bytes)
        .bind(job.total_bytes)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch a backup job by id.
    pub async fn get(&self, id: &str) -> DbResult<BackupJob> {
        sqlx::query_as::<_, BackupJob>("SELECT * FROM backup_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("backup job {}", id)))
    }

    /// Fetch a backup job by id, `None` when absent.
    pub async fn find(&self, id: &str) -> DbResult<Option<BackupJob>> {
        Ok(
            sqlx::query_as::<_, BackupJob>("SELECT * FROM backup_jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// List backups in a repository, newest first.
    pub async fn list_by_repository(&self, repository_id: &str) -> DbResult<Vec<BackupJob>> {
        Ok(sqlx::query_as::<_, BackupJob>(
            "SELECT * FROM backup_jobs WHERE repository_id = $1 ORDER BY created_at DESC",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Ordered members of a (vm context, disk) chain, oldest first.
    pub async fn list_chain_members(
        &self,
        vm_context_id: &str,
        disk_index: i32,
    ) -> DbResult<Vec<BackupJob>> {
        Ok(sqlx::query_as::<_, BackupJob>(
            r#"
            SELECT * FROM backup_jobs
            WHERE vm_context_id = $1 AND disk_index = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(vm_context_id)
        .bind(disk_index)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Whether a completed full backup exists for this VM in this repository.
    pub async fn has_completed_full(
        &self,
        vm_context_id: &str,
        repository_id: &str,
    ) -> DbResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM backup_jobs
                WHERE vm_context_id = $1 AND repository_id = $2
                  AND backup_type = 'full' AND status = 'completed'
            ) AS present
            "#,
        )
        .bind(vm_context_id)
        .bind(repository_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<bool, _>("present"))
    }

    /// Count backups referencing this backup as their parent.
    pub async fn count_dependents(&self, backup_id: &str) -> DbResult<i64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM backup_jobs WHERE parent_backup_id = $1")
                .bind(backup_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(row.get::<i64, _>("n"))
    }

    /// Update job status; terminal transitions stamp `completed_at`.
    pub async fn update_status(
        &self,
        id: &str,
        status: &str,
        error_message: Option<&str>,
    ) -> DbResult<()> {
        let completed = matches!(status, "completed" | "failed" | "cancelled");
        let result = sqlx::query(
            r#"
            UPDATE backup_jobs
            SET status = $2,
                error_message = COALESCE($3, error_message),
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error_message)
        .bind(completed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("backup job {}", id)));
        }

        Ok(())
    }

    /// Persist merged telemetry fields for a job. The caller computes the
    /// sparse-merged values; this writes them and stamps telemetry arrival.
    pub async fn update_progress(&self, job: &BackupJob) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE backup_jobs
            SET status = $2,
                current_phase = $3,
                bytes_transferred = $4,
                total_bytes = $5,
                transfer_speed_bps = $6,
                eta_seconds = $7,
                progress_percent = $8,
                size_bytes = $9,
                error_message = $10,
                completed_at = $11,
                last_telemetry_at = $12
            WHERE id = $1
            "#,
        )
        .bind(&job.id)
        .bind(&job.status)
        .bind(&job.current_phase)
        .bind(job.bytes_transferred)
        .bind(job.total_bytes)
        .bind(job.transfer_speed_bps)
        .bind(job.eta_seconds)
        .bind(job.progress_percent)
        .bind(job.size_bytes)
        .bind(&job.error_message)
        .bind(job.completed_at)
        .bind(job.last_telemetry_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Running jobs whose telemetry is older than the cutoff (or absent and
    /// the job itself is older).
    pub async fn list_running_stalled(
        &self,
        cutoff: DateTime<Utc>,
    ) -> DbResult<Vec<BackupJob>> {
        Ok(sqlx::query_as::<_, BackupJob>(
            r#"
            SELECT * FROM backup_jobs
            WHERE status = 'running'
              AND COALESCE(last_telemetry_at, created_at) < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Atomically fail a still-running job. Returns false when the job moved
    /// to another state in the meantime.
    pub async fn fail_if_running(&self, id: &str, error_message: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE backup_jobs
            SET status = 'failed', error_message = $2, completed_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Most recent non-terminal job whose disks include the given volume,
    /// used when reconciling surviving exports by their stable name.
    pub async fn find_non_terminal_by_volume(
        &self,
        volume_uuid: &str,
    ) -> DbResult<Option<BackupJob>> {
        Ok(sqlx::query_as::<_, BackupJob>(
            r#"
            SELECT j.* FROM backup_jobs j
            JOIN backup_disks d ON d.job_id = j.id
            WHERE d.volume_uuid = $1 AND j.status IN ('pending', 'running')
            ORDER BY j.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(volume_uuid)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// All jobs not yet in a terminal state, used by startup recovery.
    pub async fn list_non_terminal(&self) -> DbResult<Vec<BackupJob>> {
        Ok(sqlx::query_as::<_, BackupJob>(
            "SELECT * FROM backup_jobs WHERE status IN ('pending', 'running') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Whether the VM currently has a running job.
    pub async fn vm_has_running_job(&self, vm_context_id: &str) -> DbResult<bool> {
        Ok(self.running_job_id(vm_context_id).await?.is_some())
    }

    /// Id of the VM's most recent running job, when one exists.
    pub async fn running_job_id(&self, vm_context_id: &str) -> DbResult<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM backup_jobs
            WHERE vm_context_id = $1 AND status = 'running'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(vm_context_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<String, _>("id")))
    }

    /// Delete a backup job row inside an open transaction.
    pub async fn delete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
    ) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM backup_jobs WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("backup job {}", id)));
        }

        Ok(())
    }

    /// Delete a backup job row.
    pub async fn delete(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM backup_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("backup job {}", id)));
        }

        Ok(())
    }

    /// Count backups stored in a repository.
    pub async fn count_in_repository(&self, repository_id: &str) -> DbResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM backup_jobs WHERE repository_id = $1")
            .bind(repository_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get::<i64, _>("n"))
    }

    /// Backups in an immutable repository created before the cutoff,
    /// candidates for write protection.
    pub async fn list_completed_before(
        &self,
        repository_id: &str,
        cutoff: DateTime<Utc>,
    ) -> DbResult<Vec<BackupJob>> {
        Ok(sqlx::query_as::<_, BackupJob>(
            r#"
            SELECT * FROM backup_jobs
            WHERE repository_id = $1 AND status = 'completed' AND created_at < $2
            "#,
        )
        .bind(repository_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Upsert one per-disk progress row.
    pub async fn upsert_disk(&self, disk: &BackupDisk) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_disks (job_id, disk_index, volume_uuid, bytes_transferred, total_bytes, progress_percent, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id, disk_index) DO UPDATE
            SET volume_uuid = COALESCE(EXCLUDED.volume_uuid, backup_disks.volume_uuid),
                bytes_transferred = EXCLUDED.bytes_transferred,
                total_bytes = EXCLUDED.total_bytes,
                progress_percent = EXCLUDED.progress_percent,
                status = EXCLUDED.status
            "#,
        )
        .bind(&disk.job_id)
        .bind(disk.disk_index)
        .bind(&disk.volume_uuid)
        .bind(disk.bytes_transferred)
        .bind(disk.total_bytes)
        .bind(disk.progress_percent)
        .bind(&disk.status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Per-disk progress rows for a job.
    pub async fn get_disks(&self, job_id: &str) -> DbResult<Vec<BackupDisk>> {
        Ok(sqlx::query_as::<_, BackupDisk>(
            "SELECT * FROM backup_disks WHERE job_id = $1 ORDER BY disk_index ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?)
    }
}
