//! Chain tracking.
//!
//! A chain is the ordered set of one full backup and the incrementals
//! descended from it, for one (VM context, disk). Head/tail updates run
//! inside a transaction holding the chain row lock, which is the only
//! authoritative source of `latest_backup_id` and `full_backup_id`.

use crate::error::{ChainError, StorageError, StorageResult};
use chrono::Utc;
use haven_core::ids;
use haven_db::models::{BackupChain, BackupJob};
use haven_db::{BackupJobStore, ChainStore, Pool, TransactionManager};
use tracing::debug;

/// Transient failures on the chain row lock retry this many times.
const CHAIN_TX_RETRIES: u32 = 3;

/// A chain row together with its ordered member backups.
#[derive(Debug, Clone)]
pub struct ChainWithMembers {
    pub chain: BackupChain,
    /// Members ordered by creation time, oldest first.
    pub members: Vec<BackupJob>,
}

/// Transactional chain bookkeeping and validation.
pub struct ChainManager {
    tx: TransactionManager,
    chains: ChainStore,
    backups: BackupJobStore,
}

impl ChainManager {
    /// Create a chain manager over the shared pool.
    pub fn new(pool: Pool) -> Self {
        let chains = ChainStore::new(&pool);
        let backups = BackupJobStore::new(&pool);
        Self {
            tx: TransactionManager::new(pool.inner().clone()),
            chains,
            backups,
        }
    }

    /// Existing chain for the (VM context, disk), creating an empty-anchor
    /// chain when absent.
    pub async fn get_or_create(
        &self,
        vm_context_id: &str,
        disk_index: i32,
    ) -> StorageResult<BackupChain> {
        if let Some(chain) = self.chains.find_by_vm_disk(vm_context_id, disk_index).await? {
            return Ok(chain);
        }

        let now = Utc::now();
        let chain = BackupChain {
            id: ids::chain_id(vm_context_id, disk_index),
            vm_context_id: vm_context_id.to_string(),
            disk_index,
            full_backup_id: String::new(),
            latest_backup_id: String::new(),
            total_backups: 0,
            total_size_bytes: 0,
            created_at: now,
            updated_at: now,
        };

        debug!(chain_id = %chain.id, "creating backup chain");
        self.chains.create(&chain).await?;
        Ok(chain)
    }

    /// Chain for a (VM context, disk) with the full ordered member list.
    pub async fn get(
        &self,
        vm_context_id: &str,
        disk_index: i32,
    ) -> StorageResult<ChainWithMembers> {
        let chain = self
            .chains
            .find_by_vm_disk(vm_context_id, disk_index)
            .await?
            .ok_or_else(|| {
                StorageError::BackupNotFound(ids::chain_id(vm_context_id, disk_index))
            })?;

        self.with_members(chain).await
    }

    /// Chain by id with the full ordered member list.
    pub async fn get_by_id(&self, chain_id: &str) -> StorageResult<ChainWithMembers> {
        let chain = self.chains.get(chain_id).await?;
        self.with_members(chain).await
    }

    async fn with_members(&self, chain: BackupChain) -> StorageResult<ChainWithMembers> {
        let members = self
            .backups
            .list_chain_members(&chain.vm_context_id, chain.disk_index)
            .await?;
        Ok(ChainWithMembers { chain, members })
    }

    /// Add a backup to the chain under the chain row lock: sets the anchor
    /// for the first full, always advances `latest`, bumps counters.
    /// Transient database failures retry with backoff.
    pub async fn add_backup(&self, chain_id: &str, backup: &BackupJob) -> StorageResult<()> {
        self.tx
            .execute_with_retry(CHAIN_TX_RETRIES, |tx| {
                let chains = self.chains.clone();
                let chain_id = chain_id.to_string();
                let backup_id = backup.id.clone();
                let backup_type = backup.backup_type.clone();
                let size_bytes = backup.size_bytes;
                Box::pin(async move {
                    let mut chain = chains.get_for_update(tx, &chain_id).await?;

                    if backup_type == "full" && chain.full_backup_id.is_empty() {
                        chain.full_backup_id = backup_id.clone();
                    }
                    chain.latest_backup_id = backup_id;
                    chain.total_backups += 1;
                    // Zero at creation; the final size lands through
                    // sync_member_sizes once telemetry completes the member.
                    chain.total_size_bytes += size_bytes;

                    chains.update_in_tx(tx, &chain).await
                })
            })
            .await
            .map_err(|e| chain_err(chain_id, "update_chain", e))?;

        debug!(chain_id, backup_id = %backup.id, "added backup to chain");
        Ok(())
    }

    /// Remove a backup from the chain bookkeeping: decrements the counter
    /// and subtracts the member's recorded size.
    pub async fn remove_backup(&self, chain_id: &str, backup_id: &str) -> StorageResult<()> {
        self.tx
            .execute_with_retry(CHAIN_TX_RETRIES, |tx| {
                let chains = self.chains.clone();
                let chain_id = chain_id.to_string();
                let backup_id = backup_id.to_string();
                Box::pin(async move {
                    let mut chain = chains.get_for_update(tx, &chain_id).await?;
                    let size = chains.member_size_in_tx(tx, &backup_id).await?;

                    chain.total_backups = (chain.total_backups - 1).max(0);
                    chain.total_size_bytes = (chain.total_size_bytes - size).max(0);
                    if chain.full_backup_id == backup_id {
                        chain.full_backup_id = String::new();
                    }
                    if chain.latest_backup_id == backup_id {
                        chain.latest_backup_id = String::new();
                    }

                    chains.update_in_tx(tx, &chain).await
                })
            })
            .await
            .map_err(|e| chain_err(chain_id, "update_chain", e))?;

        debug!(chain_id, backup_id, "removed backup from chain");
        Ok(())
    }

    /// Re-derive chain counters from the member rows under the chain row
    /// lock. A member's size is zero when it joins the chain and only
    /// becomes final when telemetry completes the backup, so the totals
    /// recorded at add time go stale until this runs.
    pub async fn sync_member_sizes(&self, chain_id: &str) -> StorageResult<()> {
        self.tx
            .execute_with_retry(CHAIN_TX_RETRIES, |tx| {
                let chains = self.chains.clone();
                let chain_id = chain_id.to_string();
                Box::pin(async move {
                    let mut chain = chains.get_for_update(tx, &chain_id).await?;
                    let members = chains
                        .list_members_in_tx(tx, &chain.vm_context_id, chain.disk_index)
                        .await?;

                    let (total_backups, total_size_bytes) = chain_totals(&members);
                    chain.total_backups = total_backups;
                    chain.total_size_bytes = total_size_bytes;

                    chains.update_in_tx(tx, &chain).await
                })
            })
            .await
            .map_err(|e| chain_err(chain_id, "update_chain", e))?;

        debug!(chain_id, "chain totals resynced");
        Ok(())
    }

    /// Validate chain structure, returning the first violation.
    pub async fn validate(&self, chain_id: &str) -> StorageResult<()> {
        let chain = self.get_by_id(chain_id).await?;
        validate_members(chain_id, &chain.members).map_err(StorageError::Chain)
    }

    /// A backup can be deleted iff no other backup lists it as parent.
    pub async fn can_delete(&self, backup_id: &str) -> StorageResult<bool> {
        Ok(self.backups.count_dependents(backup_id).await? == 0)
    }
}

fn chain_err(chain_id: &str, op: &'static str, cause: impl std::fmt::Display) -> StorageError {
    StorageError::Chain(ChainError::new(chain_id, op, cause.to_string()))
}

/// Chain counters derived from the member rows: `(total_backups,
/// total_size_bytes)`.
pub fn chain_totals(members: &[BackupJob]) -> (i32, i64) {
    (
        members.len() as i32,
        members.iter().map(|m| m.size_bytes).sum(),
    )
}

/// Structural validation over the ordered member list.
///
/// An empty chain is valid. The first member must be a full backup with an
/// empty parent; every subsequent incremental must name a parent that
/// resolves to an earlier member.
pub fn validate_members(chain_id: &str, members: &[BackupJob]) -> Result<(), ChainError> {
    let Some(first) = members.first() else {
        return Ok(());
    };

    if first.backup_type != "full" {
        return Err(ChainError::new(chain_id, "validate", "must start with full"));
    }
    if first.parent_backup_id.as_deref().is_some_and(|p| !p.is_empty()) {
        return Err(ChainError::new(
            chain_id,
            "validate",
            format!("full backup {} has a parent", first.id),
        ));
    }

    for member in &members[1..] {
        if member.backup_type != "incremental" {
            continue;
        }

        let parent = member.parent_backup_id.as_deref().unwrap_or("");
        if parent.is_empty() {
            return Err(ChainError::new(
                chain_id,
                "validate",
                format!("incremental {} has no parent", member.id),
            ));
        }
        if !members.iter().any(|m| m.id == parent) {
            return Err(ChainError::new(
                chain_id,
                "validate",
                format!("incremental {} parent {} is not a chain member", member.id, parent),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn member(id: &str, backup_type: &str, parent: Option<&str>) -> BackupJob {
        BackupJob {
            id: id.to_string(),
            vm_context_id: "ctx".to_string(),
            vm_name: "vm".to_string(),
            disk_index: 0,
            backup_type: backup_type.to_string(),
            status: "completed".to_string(),
            parent_backup_id: parent.map(str::to_string),
            change_id: None,
            repository_id: "repo".to_string(),
            file_path: String::new(),
            size_bytes: 0,
            total_bytes: 0,
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

    #[test]
    fn test_empty_chain_is_valid() {
        assert!(validate_members("chain-x", &[]).is_ok());
    }

    #[test]
    fn test_chain_totals_sum_member_sizes() {
        let mut full = member("b1", "full", None);
        full.size_bytes = 200_704;
        let mut incr = member("b2", "incremental", Some("b1"));
        incr.size_bytes = 65_536;

        let (count, total) = chain_totals(&[full, incr]);
        assert_eq!(count, 2);
        assert_eq!(total, 266_240);
    }

    #[test]
    fn test_chain_totals_on_empty_chain() {
        assert_eq!(chain_totals(&[]), (0, 0));
    }

    #[test]
    fn test_chain_must_start_with_full() {
        let members = vec![member("b1", "incremental", Some("b0"))];
        let err = validate_members("chain-x", &members).unwrap_err();
        assert!(err.to_string().contains("must start with full"));
    }

    #[test]
    fn test_full_anchor_must_have_no_parent() {
        let members = vec![member("b1", "full", Some("b0"))];
        let err = validate_members("chain-x", &members).unwrap_err();
        assert!(err.to_string().contains("has a parent"));
    }

    #[test]
    fn test_incremental_parent_must_resolve() {
        let members = vec![
            member("b1", "full", None),
            member("b2", "incremental", Some("b1")),
            member("b3", "incremental", Some("missing")),
        ];
        let err = validate_members("chain-x", &members).unwrap_err();
        assert!(err.to_string().contains("not a chain member"));
    }

    #[test]
    fn test_valid_full_plus_incrementals() {
        let members = vec![
            member("b1", "full", None),
            member("b2", "incremental", Some("b1")),
            member("b3", "incremental", Some("b2")),
        ];
        assert!(validate_members("chain-x", &members).is_ok());
    }

    #[test]
    fn test_incremental_without_parent_rejected() {
        let members = vec![
            member("b1", "full", None),
            member("b2", "incremental", None),
        ];
        let err = validate_members("chain-x", &members).unwrap_err();
        assert!(err.to_string().contains("has no parent"));
    }
}
