//! Repository configuration queries.

use crate::error::{DbError, DbResult};
use crate::models::Repository;
use crate::pool::Pool;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Store for `repositories`.
pub struct RepositoryStore {
    pool: PgPool,
}

impl RepositoryStore {
    /// Create a new store.
    pub fn new(pool: &Pool) -> Self {
        Self {
            pool: pool.inner().clone(),
        }
    }

    /// Fetch a repository by id.
    pub async fn get(&self, id: &str) -> DbResult<Repository> {
        sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))
    }

    /// All enabled repository configurations.
    pub async fn list_enabled(&self) -> DbResult<Vec<Repository>> {
        Ok(sqlx::query_as::<_, Repository>(
            "SELECT * FROM repositories WHERE enabled = TRUE ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Enabled repositories flagged immutable, for the grace-period sweep.
    pub async fn list_immutable(&self) -> DbResult<Vec<Repository>> {
        Ok(sqlx::query_as::<_, Repository>(
            "SELECT * FROM repositories WHERE enabled = TRUE AND is_immutable = TRUE",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Insert a repository configuration.
    pub async fn insert(&self, repo: &Repository) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO repositories (
                id, name, repo_type, config, enabled, is_immutable,
                min_retention_days, grace_period_days,
                total_bytes, used_bytes, available_bytes, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&repo.id)
        .bind(&repo.name)
        .bind(&repo.repo_type)
        .bind(&repo.config)
        .bind(repo.enabled)
        .bind(repo.is_immutable)
        .bind(repo.min_retention_days)
        .bind(repo.grace_period_days)
        .bind(repo.total_bytes)
        .bind(repo.used_bytes)
        .bind(repo.available_bytes)
        .bind(repo.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Replace the stored configuration for a repository.
    pub async fn update(&self, repo: &Repository) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE repositories
            SET name = $2, repo_type = $3, config = $4, enabled = $5,
                is_immutable = $6, min_retention_days = $7, grace_period_days = $8
            WHERE id = $1
            "#,
        )
        .bind(&repo.id)
        .bind(&repo.name)
        .bind(&repo.repo_type)
        .bind(&repo.config)
        .bind(repo.enabled)
        .bind(repo.is_immutable)
        .bind(repo.min_retention_days)
        .bind(repo.grace_period_days)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("repository {}", repo.id)));
        }

        Ok(())
    }

    /// Delete a repository row.
    pub async fn delete(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM repositories WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("repository {}", id)));
        }

        Ok(())
    }

    /// Persist a capacity snapshot.
    pub async fn update_capacity(
        &self,
        id: &str,
        total_bytes: i64,
        used_bytes: i64,
        available_bytes: i64,
        checked_at: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE repositories
            SET total_bytes = $2, used_bytes = $3, available_bytes = $4, last_check_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total_bytes)
        .bind(used_bytes)
        .bind(available_bytes)
        .bind(checked_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
