//! Metadata sidecars.
//!
//! Every backup file gets a JSON sidecar at `<backup>.json` and every chain
//! directory a `chain.json`. Writes are atomic: temp file, fsync, rename.

use crate::error::StorageResult;
use crate::qcow2::Qcow2Info;
use chrono::{DateTime, Utc};
use haven_db::models::{BackupChain, BackupJob};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Sidecar written next to each QCOW2 backup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSidecar {
    pub backup_id: String,
    pub vm_context_id: String,
    pub vm_name: String,
    pub disk_id: i32,
    pub backup_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_backup_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub size_bytes: i64,
    pub total_bytes: i64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub qcow2_info: SidecarImageInfo,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Image geometry captured at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarImageInfo {
    pub virtual_size: i64,
    pub actual_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<String>,
    pub format: String,
    pub cluster_size: i64,
    pub compressed: bool,
    pub encrypted: bool,
    pub dirty_flag: bool,
}

impl From<&Qcow2Info> for SidecarImageInfo {
    fn from(info: &Qcow2Info) -> Self {
        Self {
            virtual_size: info.virtual_size,
            actual_size: info.actual_size,
            backing_file: info.backing_file.clone(),
            format: info.format.clone(),
            cluster_size: info.cluster_size,
            compressed: info.compressed,
            encrypted: info.encrypted,
            dirty_flag: info.dirty_flag,
        }
    }
}

/// Sidecar written into each chain directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSidecar {
    pub chain_id: String,
    pub vm_context_id: String,
    pub disk_id: i32,
    pub full_backup_id: String,
    pub backup_ids: Vec<String>,
    pub total_backups: i32,
    pub total_size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackupSidecar {
    /// Build a sidecar from a job row and its image geometry.
    pub fn from_job(job: &BackupJob, info: &Qcow2Info) -> Self {
        Self {
            backup_id: job.id.clone(),
            vm_context_id: job.vm_context_id.clone(),
            vm_name: job.vm_name.clone(),
            disk_id: job.disk_index,
            backup_type: job.backup_type.clone(),
            parent_backup_id: job.parent_backup_id.clone(),
            change_id: job.change_id.clone(),
            size_bytes: job.size_bytes,
            total_bytes: job.total_bytes,
            created_at: job.created_at,
            completed_at: job.completed_at,
            qcow2_info: SidecarImageInfo::from(info),
            metadata: serde_json::Map::new(),
        }
    }
}

impl ChainSidecar {
    /// Build a sidecar from a chain row and its ordered member ids.
    pub fn from_chain(chain: &BackupChain, backup_ids: Vec<String>) -> Self {
        Self {
            chain_id: chain.id.clone(),
            vm_context_id: chain.vm_context_id.clone(),
            disk_id: chain.disk_index,
            full_backup_id: chain.full_backup_id.clone(),
            backup_ids,
            total_backups: chain.total_backups,
            total_size_bytes: chain.total_size_bytes,
            created_at: chain.created_at,
            updated_at: chain.updated_at,
        }
    }
}

/// Sidecar path for a backup file.
pub fn backup_sidecar_path(backup_file: &Path) -> PathBuf {
    let mut os = backup_file.as_os_str().to_owned();
    os.push(".json");
    PathBuf::from(os)
}

/// Sidecar path for a chain directory.
pub fn chain_sidecar_path(chain_dir: &Path) -> PathBuf {
    chain_dir.join("chain.json")
}

/// Save a backup sidecar atomically.
pub fn save_backup_sidecar(backup_file: &Path, sidecar: &BackupSidecar) -> StorageResult<()> {
    write_atomic(&backup_sidecar_path(backup_file), sidecar)
}

/// Load a backup sidecar.
pub fn load_backup_sidecar(backup_file: &Path) -> StorageResult<BackupSidecar> {
    let data = std::fs::read(backup_sidecar_path(backup_file))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Save a chain sidecar atomically.
pub fn save_chain_sidecar(chain_dir: &Path, sidecar: &ChainSidecar) -> StorageResult<()> {
    write_atomic(&chain_sidecar_path(chain_dir), sidecar)
}

/// Load a chain sidecar.
pub fn load_chain_sidecar(chain_dir: &Path) -> StorageResult<ChainSidecar> {
    let data = std::fs::read(chain_sidecar_path(chain_dir))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Two-space-indented JSON via temp file, fsync, rename.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    use std::io::Write;

    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');

    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> BackupJob {
        BackupJob {
            id: "backup-web01-disk0-20250101-000000".to_string(),
            vm_context_id: "ctx-web01".to_string(),
            vm_name: "web01".to_string(),
            disk_index: 0,
            backup_type: "full".to_string(),
            status: "completed".to_string(),
            parent_backup_id: None,
            change_id: Some("52 3c ec 11".to_string()),
            repository_id: "repo-local".to_string(),
            file_path: "/tmp/r/b.qcow2".to_string(),
            size_bytes: 200704,
            total_bytes: 1073741824,
            bytes_transferred: 1073741824,
            progress_percent: 100.0,
            transfer_speed_bps: 0,
            eta_seconds: 0,
            current_phase: "done".to_string(),
            error_message: None,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
            last_telemetry_at: Some(Utc::now()),
        }
    }

    fn sample_info() -> Qcow2Info {
        serde_json::from_str(
            r#"{"virtual-size": 1073741824, "actual-size": 200704,
                "cluster-size": 65536, "format": "qcow2"}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_sidecar_paths() {
        assert_eq!(
            backup_sidecar_path(Path::new("/r/ctx/disk-0/b.qcow2")),
            PathBuf::from("/r/ctx/disk-0/b.qcow2.json")
        );
        assert_eq!(
            chain_sidecar_path(Path::new("/r/ctx/disk-0")),
            PathBuf::from("/r/ctx/disk-0/chain.json")
        );
    }

    #[test]
    fn test_backup_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("b.qcow2");
        std::fs::write(&file, b"stub").unwrap();

        let sidecar = BackupSidecar::from_job(&sample_job(), &sample_info());
        save_backup_sidecar(&file, &sidecar).unwrap();

        let loaded = load_backup_sidecar(&file).unwrap();
        assert_eq!(
            serde_json::to_value(&loaded).unwrap(),
            serde_json::to_value(&sidecar).unwrap()
        );
        // No stray temp file remains.
        assert!(!dir.path().join("b.qcow2.json.tmp").exists());
    }

    #[test]
    fn test_chain_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let chain = BackupChain {
            id: "chain-ctx-web01-disk0".to_string(),
            vm_context_id: "ctx-web01".to_string(),
            disk_index: 0,
            full_backup_id: "backup-web01-disk0-20250101-000000".to_string(),
            latest_backup_id: "backup-web01-disk0-20250102-000000".to_string(),
            total_backups: 2,
            total_size_bytes: 4096,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let sidecar = ChainSidecar::from_chain(
            &chain,
            vec![chain.full_backup_id.clone(), chain.latest_backup_id.clone()],
        );
        save_chain_sidecar(dir.path(), &sidecar).unwrap();

        let loaded = load_chain_sidecar(dir.path()).unwrap();
        assert_eq!(loaded.backup_ids.len(), 2);
        assert_eq!(loaded.chain_id, chain.id);
    }

    #[test]
    fn test_output_is_pretty_printed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("b.qcow2");
        std::fs::write(&file, b"stub").unwrap();

        let sidecar = BackupSidecar::from_job(&sample_job(), &sample_info());
        save_backup_sidecar(&file, &sidecar).unwrap();

        let raw = std::fs::read_to_string(backup_sidecar_path(&file)).unwrap();
        assert!(raw.starts_with("{\n  \""), "two-space indentation expected");
    }
}
