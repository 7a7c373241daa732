//! Semantic identifier construction.
//!
//! Backups and chains use human-readable ids so operators can correlate
//! database rows, files on disk and agent logs without a lookup table.

use chrono::{DateTime, Utc};

/// Build a backup id: `backup-<vm>-disk<n>-<timestamp>`.
pub fn backup_id(vm_name: &str, disk_index: i32, at: DateTime<Utc>) -> String {
    format!(
        "backup-{}-disk{}-{}",
        vm_name,
        disk_index,
        at.format("%Y%m%d-%H%M%S")
    )
}

/// Build a chain id: `chain-<vm_context>-disk<n>`.
pub fn chain_id(vm_context_id: &str, disk_index: i32) -> String {
    format!("chain-{}-disk{}", vm_context_id, disk_index)
}

/// Stable NBD export name derived from the volume identity.
///
/// Recovery tries this form before falling back to raw job ids, so it must
/// never change shape.
pub fn volume_export_name(volume_uuid: &str) -> String {
    format!("migration-vol-{}", volume_uuid)
}

/// Export name for a backup job disk, carrying job and disk for operator
/// traceability.
pub fn backup_export_name(job_id: &str, disk_index: i32) -> String {
    format!("{}-disk{}", job_id, disk_index)
}

/// Job id encoded in a backup export name, when the name carries one.
pub fn job_id_from_export_name(export_name: &str) -> Option<&str> {
    let (job_id, disk) = export_name.rsplit_once("-disk")?;
    if job_id.starts_with("backup-") && !disk.is_empty() && disk.bytes().all(|b| b.is_ascii_digit())
    {
        Some(job_id)
    } else {
        None
    }
}

/// Volume uuid encoded in a stable volume export name.
pub fn volume_uuid_from_export_name(export_name: &str) -> Option<&str> {
    export_name
        .strip_prefix("migration-vol-")
        .filter(|uuid| !uuid.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_id_shape() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(backup_id("web01", 0, at), "backup-web01-disk0-20250101-000000");
    }

    #[test]
    fn test_chain_id_shape() {
        assert_eq!(chain_id("ctx-web01-20250101-000000", 0), "chain-ctx-web01-20250101-000000-disk0");
    }

    #[test]
    fn test_export_names() {
        assert_eq!(
            volume_export_name("6a1c"),
            "migration-vol-6a1c"
        );
        assert_eq!(backup_export_name("backup-web01-disk0-20250101-000000", 0), "backup-web01-disk0-20250101-000000-disk0");
    }

    #[test]
    fn test_job_id_round_trips_through_export_name() {
        let job_id = "backup-web01-disk0-20250101-000000";
        let export = backup_export_name(job_id, 0);
        assert_eq!(job_id_from_export_name(&export), Some(job_id));
    }

    #[test]
    fn test_job_id_rejects_other_export_shapes() {
        assert_eq!(job_id_from_export_name("migration-vol-6a1c"), None);
        // A bare job id has no trailing disk suffix.
        assert_eq!(
            job_id_from_export_name("backup-web01-disk0-20250101-000000"),
            None
        );
    }

    #[test]
    fn test_volume_uuid_from_export_name() {
        assert_eq!(
            volume_uuid_from_export_name("migration-vol-6a1c"),
            Some("6a1c")
        );
        assert_eq!(volume_uuid_from_export_name("migration-vol-"), None);
        assert_eq!(volume_uuid_from_export_name("backup-x-disk0"), None);
    }
}
