//! Embedded schema migrations with versioning.

use crate::error::{DbError, DbResult};
use crate::pool::Pool;
use sqlx::{PgPool, Row};
use tracing::info;

/// A single schema migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Migration version
    pub version: i32,
    /// Migration name
    pub name: String,
    /// SQL to run for upgrade
    pub up: String,
}

impl Migration {
    fn new(version: i32, name: impl Into<String>, up: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            up: up.into(),
        }
    }
}

/// Applies the embedded migration set in order.
pub struct MigrationManager {
    pool: PgPool,
}

impl MigrationManager {
    /// Create a new migration manager.
    pub fn new(pool: &Pool) -> Self {
        Self {
            pool: pool.inner().clone(),
        }
    }

    /// Initialize the migration tracking table.
    pub async fn init(&self) -> DbResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::Migration(format!("failed to init tracking table: {}", e)))?;

        Ok(())
    }

    /// Current schema version, 0 when nothing has been applied.
    pub async fn current_version(&self) -> DbResult<i32> {
        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS version FROM _migrations")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbError::Migration(format!("failed to read version: {}", e)))?;

        Ok(row.get::<i32, _>("version"))
    }

    /// Apply all pending migrations.
    pub async fn run(&self) -> DbResult<i32> {
        self.init().await?;
        let current = self.current_version().await?;
        let mut applied = current;

        for migration in migrations() {
            if migration.version <= current {
                continue;
            }

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DbError::Migration(format!("failed to begin: {}", e)))?;

            sqlx::query(&migration.up)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    DbError::Migration(format!(
                        "migration {} ({}) failed: {}",
                        migration.version, migration.name, e
                    ))
                })?;

            sqlx::query("INSERT INTO _migrations (version, name) VALUES ($1, $2)")
                .bind(migration.version)
                .bind(&migration.name)
                .execute(&mut *tx)
                .await
                .map_err(|e| DbError::Migration(format!("failed to record migration: {}", e)))?;

            tx.commit()
                .await
                .map_err(|e| DbError::Migration(format!("failed to commit: {}", e)))?;

            info!(version = migration.version, name = %migration.name, "applied migration");
            applied = migration.version;
        }

        Ok(applied)
    }
}

/// The embedded migration set, in order.
fn migrations() -> Vec<Migration> {
    vec![
        Migration::new(
            1,
            "backup storage",
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                repo_type TEXT NOT NULL,
                config JSONB NOT NULL DEFAULT '{}'::jsonb,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                is_immutable BOOLEAN NOT NULL DEFAULT FALSE,
                min_retention_days INTEGER NOT NULL DEFAULT 0,
                grace_period_days INTEGER NOT NULL DEFAULT 7,
                total_bytes BIGINT NOT NULL DEFAULT 0,
                used_bytes BIGINT NOT NULL DEFAULT 0,
                available_bytes BIGINT NOT NULL DEFAULT 0,
                last_check_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS vm_contexts (
                id TEXT PRIMARY KEY,
                vm_name TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'discovered',
                current_job_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS backup_chains (
                id TEXT PRIMARY KEY,
                vm_context_id TEXT NOT NULL,
                disk_index INTEGER NOT NULL,
                full_backup_id TEXT NOT NULL DEFAULT '',
                latest_backup_id TEXT NOT NULL DEFAULT '',
                total_backups INTEGER NOT NULL DEFAULT 0,
                total_size_bytes BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (vm_context_id, disk_index)
            );

            CREATE TABLE IF NOT EXISTS backup_jobs (
                id TEXT PRIMARY KEY,
                vm_context_id TEXT NOT NULL,
                vm_name TEXT NOT NULL,
                disk_index INTEGER NOT NULL,
                backup_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                parent_backup_id TEXT,
                change_id TEXT,
                repository_id TEXT NOT NULL REFERENCES repositories(id),
                file_path TEXT NOT NULL DEFAULT '',
                size_bytes BIGINT NOT NULL DEFAULT 0,
                total_bytes BIGINT NOT NULL DEFAULT 0,
                bytes_transferred BIGINT NOT NULL DEFAULT 0,
                progress_percent DOUBLE PRECISION NOT NULL DEFAULT 0,
                transfer_speed_bps BIGINT NOT NULL DEFAULT 0,
                eta_seconds INTEGER NOT NULL DEFAULT 0,
                current_phase TEXT NOT NULL DEFAULT '',
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ,
                last_telemetry_at TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS idx_backup_jobs_status ON backup_jobs(status);
            CREATE INDEX IF NOT EXISTS idx_backup_jobs_chain
                ON backup_jobs(vm_context_id, disk_index, created_at);
            CREATE INDEX IF NOT EXISTS idx_backup_jobs_repository ON backup_jobs(repository_id);

            CREATE TABLE IF NOT EXISTS backup_disks (
                job_id TEXT NOT NULL REFERENCES backup_jobs(id) ON DELETE CASCADE,
                disk_index INTEGER NOT NULL,
                volume_uuid TEXT,
                bytes_transferred BIGINT NOT NULL DEFAULT 0,
                total_bytes BIGINT NOT NULL DEFAULT 0,
                progress_percent DOUBLE PRECISION NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                PRIMARY KEY (job_id, disk_index)
            );
            "#,
        ),
        Migration::new(
            2,
            "policies and copies",
            r#"
            CREATE TABLE IF NOT EXISTS backup_policies (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                primary_repository_id TEXT NOT NULL REFERENCES repositories(id),
                retention_days INTEGER NOT NULL DEFAULT 30,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS policy_copy_rules (
                id UUID PRIMARY KEY,
                policy_id UUID NOT NULL REFERENCES backup_policies(id) ON DELETE CASCADE,
                destination_repository_id TEXT NOT NULL REFERENCES repositories(id),
                priority INTEGER NOT NULL DEFAULT 0,
                mode TEXT NOT NULL DEFAULT 'immediate',
                verify_after_copy BOOLEAN NOT NULL DEFAULT TRUE,
                UNIQUE (policy_id, destination_repository_id)
            );

            CREATE TABLE IF NOT EXISTS backup_copies (
                id UUID PRIMARY KEY,
                source_backup_id TEXT NOT NULL REFERENCES backup_jobs(id) ON DELETE CASCADE,
                destination_repository_id TEXT NOT NULL REFERENCES repositories(id),
                file_path TEXT NOT NULL DEFAULT '',
                size_bytes BIGINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                verification_status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS idx_backup_copies_status ON backup_copies(status);
            "#,
        ),
        Migration::new(
            3,
            "flows and schedules",
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                cron_expression TEXT NOT NULL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                schedule_type TEXT NOT NULL DEFAULT 'cron',
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                max_concurrent_jobs INTEGER NOT NULL DEFAULT 1,
                skip_if_running BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS machine_groups (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                priority INTEGER NOT NULL DEFAULT 0,
                max_concurrent_vms INTEGER NOT NULL DEFAULT 1,
                schedule_id UUID REFERENCES schedules(id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS group_memberships (
                id UUID PRIMARY KEY,
                group_id UUID NOT NULL REFERENCES machine_groups(id) ON DELETE CASCADE,
                vm_context_id TEXT NOT NULL REFERENCES vm_contexts(id),
                priority INTEGER NOT NULL DEFAULT 0,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                UNIQUE (group_id, vm_context_id)
            );

            CREATE TABLE IF NOT EXISTS schedule_executions (
                id UUID PRIMARY KEY,
                schedule_id UUID NOT NULL REFERENCES schedules(id),
                status TEXT NOT NULL DEFAULT 'running',
                trigger_reason TEXT,
                jobs_created INTEGER NOT NULL DEFAULT 0,
                jobs_skipped INTEGER NOT NULL DEFAULT 0,
                jobs_failed INTEGER NOT NULL DEFAULT 0,
                vm_context_ids TEXT NOT NULL DEFAULT '',
                started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ
            );

            CREATE TABLE IF NOT EXISTS protection_flows (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                flow_type TEXT NOT NULL,
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                repository_id TEXT REFERENCES repositories(id),
                policy_id UUID REFERENCES backup_policies(id),
                schedule_id UUID REFERENCES schedules(id),
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                last_execution_id UUID,
                total_executions INTEGER NOT NULL DEFAULT 0,
                successful_executions INTEGER NOT NULL DEFAULT 0,
                failed_executions INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS flow_executions (
                id UUID PRIMARY KEY,
                flow_id UUID NOT NULL REFERENCES protection_flows(id),
                status TEXT NOT NULL DEFAULT 'running',
                execution_type TEXT NOT NULL DEFAULT 'manual',
                created_job_ids TEXT NOT NULL DEFAULT '',
                jobs_created INTEGER NOT NULL DEFAULT 0,
                jobs_completed INTEGER NOT NULL DEFAULT 0,
                jobs_failed INTEGER NOT NULL DEFAULT 0,
                jobs_skipped INTEGER NOT NULL DEFAULT 0,
                vms_processed INTEGER NOT NULL DEFAULT 0,
                bytes_transferred BIGINT NOT NULL DEFAULT 0,
                execution_time_seconds INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS idx_flow_executions_status ON flow_executions(status);
            CREATE INDEX IF NOT EXISTS idx_flow_executions_flow ON flow_executions(flow_id, started_at);
            "#,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        let set = migrations();
        let mut versions: Vec<i32> = set.iter().map(|m| m.version).collect();
        let sorted = {
            let mut v = versions.clone();
            v.sort_unstable();
            v
        };
        assert_eq!(versions, sorted);
        versions.dedup();
        assert_eq!(versions.len(), set.len());
    }

    #[test]
    fn test_migrations_nonempty_sql() {
        for m in migrations() {
            assert!(!m.up.trim().is_empty(), "migration {} has empty SQL", m.version);
        }
    }
}
