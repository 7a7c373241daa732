//! Backup policy, copy rule and backup copy queries.
//!
//! Copy workers claim work with `claim_next_pending`, which pops the oldest
//! pending row and flips it to `copying` in one statement so two workers
//! never process the same copy.

use crate::error::{DbError, DbResult};
use crate::models::{BackupCopy, BackupPolicy, CopyRule};
use crate::pool::Pool;
use sqlx::PgPool;
use uuid::Uuid;

/// Store for `backup_policies`, `policy_copy_rules` and `backup_copies`.
pub struct PolicyStore {
    pool: PgPool,
}

impl PolicyStore {
    /// Create a new store.
    pub fn new(pool: &Pool) -> Self {
        Self {
            pool: pool.inner().clone(),
        }
    }

    /// Fetch a policy by id.
    pub async fn get(&self, id: Uuid) -> DbResult<BackupPolicy> {
        sqlx::query_as::<_, BackupPolicy>("SELECT * FROM backup_policies WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("backup policy {}", id)))
    }

    /// Insert a policy.
    pub async fn insert(&self, policy: &BackupPolicy) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_policies (id, name, primary_repository_id, retention_days, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(policy.id)
        .bind(&policy.name)
        .bind(&policy.primary_repository_id)
        .bind(policy.retention_days)
        .bind(policy.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a copy rule. The destination must differ from the policy's
    /// primary repository and be unique within the policy.
    pub async fn insert_copy_rule(&self, rule: &CopyRule) -> DbResult<()> {
        let policy = self.get(rule.policy_id).await?;
        if policy.primary_repository_id == rule.destination_repository_id {
            return Err(DbError::Validation(format!(
                "copy rule destination {} matches the policy's primary repository",
                rule.destination_repository_id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO policy_copy_rules (id, policy_id, destination_repository_id, priority, mode, verify_after_copy)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(rule.id)
        .bind(rule.policy_id)
        .bind(&rule.destination_repository_id)
        .bind(rule.priority)
        .bind(&rule.mode)
        .bind(rule.verify_after_copy)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => DbError::Conflict(
                format!(
                    "policy {} already copies to {}",
                    rule.policy_id, rule.destination_repository_id
                ),
            ),
            other => DbError::Sql(other),
        })?;

        Ok(())
    }

    /// Copy rules of a policy ordered by priority.
    pub async fn list_copy_rules(&self, policy_id: Uuid) -> DbResult<Vec<CopyRule>> {
        Ok(sqlx::query_as::<_, CopyRule>(
            "SELECT * FROM policy_copy_rules WHERE policy_id = $1 ORDER BY priority ASC",
        )
        .bind(policy_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Insert a pending backup copy.
    pub async fn insert_copy(&self, copy: &BackupCopy) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_copies (
                id, source_backup_id, destination_repository_id, file_path,
                size_bytes, status, verification_status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(copy.id)
        .bind(&copy.source_backup_id)
        .bind(&copy.destination_repository_id)
        .bind(&copy.file_path)
        .bind(copy.size_bytes)
        .bind(&copy.status)
        .bind(&copy.verification_status)
        .bind(copy.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Claim the oldest pending copy: pop and mark `copying` atomically.
    /// `SKIP LOCKED` keeps concurrent workers from blocking on each other.
    pub async fn claim_next_pending(&self) -> DbResult<Option<BackupCopy>> {
        Ok(sqlx::query_as::<_, BackupCopy>(
            r#"
            UPDATE backup_copies
            SET status = 'copying', started_at = NOW()
            WHERE id = (
                SELECT id FROM backup_copies
                WHERE status = 'pending'
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Fetch a copy by id.
    pub async fn get_copy(&self, id: Uuid) -> DbResult<BackupCopy> {
        sqlx::query_as::<_, BackupCopy>("SELECT * FROM backup_copies WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("backup copy {}", id)))
    }

    /// Move a copy to a new status, optionally recording path and size.
    pub async fn update_copy_status(
        &self,
        id: Uuid,
        status: &str,
        file_path: Option<&str>,
        size_bytes: Option<i64>,
    ) -> DbResult<()> {
        let completed = matches!(status, "completed" | "failed");
        sqlx::query(
            r#"
            UPDATE backup_copies
            SET status = $2,
                file_path = COALESCE($3, file_path),
                size_bytes = COALESCE($4, size_bytes),
                completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(file_path)
        .bind(size_bytes)
        .bind(completed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the verification outcome.
    pub async fn set_verification(&self, id: Uuid, verification_status: &str) -> DbResult<()> {
        sqlx::query("UPDATE backup_copies SET verification_status = $2 WHERE id = $1")
            .bind(id)
            .bind(verification_status)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Fail a copy with an error message.
    pub async fn fail_copy(&self, id: Uuid, error_message: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE backup_copies
            SET status = 'failed', error_message = $2, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Copies of a source backup, newest first.
    pub async fn list_copies_for_backup(&self, source_backup_id: &str) -> DbResult<Vec<BackupCopy>> {
        Ok(sqlx::query_as::<_, BackupCopy>(
            "SELECT * FROM backup_copies WHERE source_backup_id = $1 ORDER BY created_at DESC",
        )
        .bind(source_backup_id)
        .fetch_all(&self.pool)
        .await?)
    }
}
