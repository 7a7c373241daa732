//! Thin façade around `qemu-img`.
//!
//! Argument construction is separated from invocation so the exact command
//! lines are unit-testable. All size arguments are bytes.

use crate::error::{StorageError, StorageResult};
use serde::Deserialize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Geometry and flags of a QCOW2 file as reported by `qemu-img info`.
#[derive(Debug, Clone, Deserialize)]
pub struct Qcow2Info {
    #[serde(rename = "virtual-size")]
    pub virtual_size: i64,
    #[serde(rename = "actual-size", default)]
    pub actual_size: i64,
    #[serde(rename = "cluster-size", default)]
    pub cluster_size: i64,
    #[serde(rename = "backing-filename")]
    pub backing_file: Option<String>,
    pub format: String,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(rename = "dirty-flag", default)]
    pub dirty_flag: bool,
}

/// Synchronous-feeling wrapper; every call shells out once.
#[derive(Clone)]
pub struct Qcow2Tool {
    binary: PathBuf,
}

impl Qcow2Tool {
    /// Create a wrapper around the given `qemu-img` binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Whether the configured binary exists.
    pub fn is_available(&self) -> bool {
        self.binary.is_file()
    }

    /// Create a standalone QCOW2 of the given virtual size.
    pub async fn create_full(&self, path: &Path, virtual_bytes: i64) -> StorageResult<()> {
        if virtual_bytes <= 0 {
            return Err(StorageError::Validation(format!(
                "QCOW2 size must be positive, got {}",
                virtual_bytes
            )));
        }

        ensure_parent_dir(path)?;
        self.run("create", path, create_full_args(path, virtual_bytes))
            .await?;
        set_file_mode(path)?;
        Ok(())
    }

    /// Create an incremental QCOW2 backed by `backing_file`. Fails before
    /// creating anything when the backing file is missing.
    pub async fn create_incremental(
        &self,
        path: &Path,
        backing_file: &Path,
    ) -> StorageResult<()> {
        if !backing_file.exists() {
            return Err(StorageError::Validation(format!(
                "backing file does not exist: {}",
                backing_file.display()
            )));
        }

        ensure_parent_dir(path)?;
        self.run(
            "create",
            path,
            create_incremental_args(path, backing_file),
        )
        .await?;
        set_file_mode(path)?;
        Ok(())
    }

    /// Parse geometry from `qemu-img info --output=json`.
    pub async fn info(&self, path: &Path) -> StorageResult<Qcow2Info> {
        let output = self.run("info", path, info_args(path)).await?;
        let info: Qcow2Info = serde_json::from_str(&output)?;
        Ok(info)
    }

    /// Consistency check; fails on any ERROR marker in the tool output.
    pub async fn verify(&self, path: &Path) -> StorageResult<()> {
        let output = self.run("check", path, check_args(path)).await?;
        if output.contains("ERROR") {
            return Err(StorageError::ImageTool {
                op: "check",
                path: path.display().to_string(),
                message: format!("image check reported errors: {}", output.trim()),
            });
        }
        Ok(())
    }

    /// Rebase onto a new backing file without copying clusters.
    pub async fn rebase(&self, path: &Path, new_backing: &Path) -> StorageResult<()> {
        self.run("rebase", path, rebase_args(path, new_backing))
            .await?;
        Ok(())
    }

    /// Commit this image's clusters into its backing file.
    pub async fn commit(&self, path: &Path) -> StorageResult<()> {
        self.run("commit", path, commit_args(path)).await?;
        Ok(())
    }

    /// Convert between formats.
    pub async fn convert(&self, src: &Path, dst: &Path, format: &str) -> StorageResult<()> {
        ensure_parent_dir(dst)?;
        self.run("convert", src, convert_args(src, dst, format))
            .await?;
        Ok(())
    }

    /// Resize the virtual disk.
    pub async fn resize(&self, path: &Path, new_bytes: i64) -> StorageResult<()> {
        if new_bytes <= 0 {
            return Err(StorageError::Validation(format!(
                "QCOW2 size must be positive, got {}",
                new_bytes
            )));
        }
        self.run("resize", path, resize_args(path, new_bytes)).await?;
        Ok(())
    }

    async fn run(
        &self,
        op: &'static str,
        path: &Path,
        args: Vec<String>,
    ) -> StorageResult<String> {
        debug!(op, path = %path.display(), "invoking qemu-img");

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| StorageError::ImageTool {
                op,
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(StorageError::ImageTool {
                op,
                path: path.display().to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Create the parent directory tree with 0755.
fn ensure_parent_dir(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Backup files are world-readable, owner-writable.
fn set_file_mode(path: &Path) -> StorageResult<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
    Ok(())
}

fn create_full_args(path: &Path, virtual_bytes: i64) -> Vec<String> {
    vec![
        "create".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        path.display().to_string(),
        virtual_bytes.to_string(),
    ]
}

fn create_incremental_args(path: &Path, backing_file: &Path) -> Vec<String> {
    vec![
        "create".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        "-b".to_string(),
        backing_file.display().to_string(),
        "-F".to_string(),
        "qcow2".to_string(),
        path.display().to_string(),
    ]
}

fn info_args(path: &Path) -> Vec<String> {
    vec![
        "info".to_string(),
        "--output=json".to_string(),
        path.display().to_string(),
    ]
}

fn check_args(path: &Path) -> Vec<String> {
    vec!["check".to_string(), path.display().to_string()]
}

fn rebase_args(path: &Path, new_backing: &Path) -> Vec<String> {
    vec![
        "rebase".to_string(),
        "-u".to_string(),
        "-b".to_string(),
        new_backing.display().to_string(),
        path.display().to_string(),
    ]
}

fn commit_args(path: &Path) -> Vec<String> {
    vec!["commit".to_string(), path.display().to_string()]
}

fn convert_args(src: &Path, dst: &Path, format: &str) -> Vec<String> {
    vec![
        "convert".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        "-O".to_string(),
        format.to_string(),
        src.display().to_string(),
        dst.display().to_string(),
    ]
}

fn resize_args(path: &Path, new_bytes: i64) -> Vec<String> {
    vec![
        "resize".to_string(),
        path.display().to_string(),
        new_bytes.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_full_args() {
        let args = create_full_args(Path::new("/tmp/r/b.qcow2"), 1073741824);
        assert_eq!(args, vec!["create", "-f", "qcow2", "/tmp/r/b.qcow2", "1073741824"]);
    }

    #[test]
    fn test_create_incremental_args() {
        let args =
            create_incremental_args(Path::new("/tmp/r/i.qcow2"), Path::new("/tmp/r/f.qcow2"));
        assert_eq!(
            args,
            vec!["create", "-f", "qcow2", "-b", "/tmp/r/f.qcow2", "-F", "qcow2", "/tmp/r/i.qcow2"]
        );
    }

    #[test]
    fn test_rebase_is_unsafe_mode() {
        let args = rebase_args(Path::new("/a.qcow2"), Path::new("/b.qcow2"));
        assert_eq!(args, vec!["rebase", "-u", "-b", "/b.qcow2", "/a.qcow2"]);
    }

    #[test]
    fn test_convert_and_resize_args() {
        assert_eq!(
            convert_args(Path::new("/s.qcow2"), Path::new("/d.raw"), "raw"),
            vec!["convert", "-f", "qcow2", "-O", "raw", "/s.qcow2", "/d.raw"]
        );
        assert_eq!(
            resize_args(Path::new("/s.qcow2"), 42),
            vec!["resize", "/s.qcow2", "42"]
        );
    }

    #[tokio::test]
    async fn test_create_full_rejects_non_positive_size() {
        let tool = Qcow2Tool::new("/usr/bin/qemu-img");
        for size in [0, -1] {
            let err = tool
                .create_full(Path::new("/tmp/never.qcow2"), size)
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn test_create_incremental_requires_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Qcow2Tool::new("/usr/bin/qemu-img");
        let target = dir.path().join("incr.qcow2");
        let missing = dir.path().join("missing.qcow2");

        let err = tool
            .create_incremental(&target, &missing)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
        assert!(!target.exists(), "nothing may be created on failure");
    }

    #[test]
    fn test_info_json_parsing() {
        let json = r#"{
            "virtual-size": 1073741824,
            "actual-size": 200704,
            "cluster-size": 65536,
            "backing-filename": "/tmp/r/full.qcow2",
            "format": "qcow2",
            "dirty-flag": false
        }"#;
        let info: Qcow2Info = serde_json::from_str(json).unwrap();
        assert_eq!(info.virtual_size, 1073741824);
        assert_eq!(info.cluster_size, 65536);
        assert_eq!(info.backing_file.as_deref(), Some("/tmp/r/full.qcow2"));
        assert!(!info.dirty_flag);
        assert!(!info.compressed);
    }
}
