//! Network share mounting for NFS and CIFS repositories.
//!
//! Option strings are parsed, trimmed and augmented with defaults before
//! the mount syscall. CIFS credentials come from a secret reference and a
//! root-only credentials file; they never appear in the option string.

use crate::error::{StorageError, StorageResult};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Default options applied to every share mount.
const DEFAULT_OPTIONS: [&str; 2] = ["rw", "hard"];

/// Resolves a secret reference to the actual credential material.
pub trait SecretResolver: Send + Sync {
    /// Resolve `(username, password)` for a secret reference.
    fn resolve(&self, secret_ref: &str) -> StorageResult<(String, String)>;
}

/// Mounts and unmounts network shares.
pub struct MountManager {
    secrets: Option<Box<dyn SecretResolver>>,
}

impl MountManager {
    /// Create a mount manager. CIFS mounts require a secret resolver.
    pub fn new(secrets: Option<Box<dyn SecretResolver>>) -> Self {
        Self { secrets }
    }

    /// Mount an NFS export at the mount point.
    pub async fn mount_nfs(
        &self,
        server: &str,
        export: &str,
        mount_point: &Path,
        version: Option<&str>,
        options: &str,
    ) -> StorageResult<()> {
        std::fs::create_dir_all(mount_point)?;

        let opts = build_nfs_options(options, version);
        let source = format!("{}:{}", server, export);

        debug!(source = %source, mount_point = %mount_point.display(), opts = %opts, "mounting NFS share");
        run_mount(&[
            "-t",
            "nfs",
            "-o",
            &opts,
            &source,
            &mount_point.display().to_string(),
        ])
        .await?;

        info!(source = %source, mount_point = %mount_point.display(), "mounted NFS share");
        Ok(())
    }

    /// Mount a CIFS share at the mount point. Credentials are materialised
    /// into a 0600 credentials file referenced from the options.
    pub async fn mount_cifs(
        &self,
        server: &str,
        share: &str,
        mount_point: &Path,
        secret_ref: &str,
        domain: Option<&str>,
        options: &str,
    ) -> StorageResult<()> {
        let resolver = self.secrets.as_ref().ok_or_else(|| {
            StorageError::Validation("CIFS mount requires a secret resolver".to_string())
        })?;
        let (username, password) = resolver.resolve(secret_ref)?;

        std::fs::create_dir_all(mount_point)?;
        let credentials_file = write_credentials_file(&username, &password, domain)?;

        let mut opts = build_share_options(options);
        opts.push(format!("credentials={}", credentials_file.display()));
        let opts = opts.join(",");
        let source = format!("//{}/{}", server, share);

        debug!(source = %source, mount_point = %mount_point.display(), "mounting CIFS share");
        let result = run_mount(&[
            "-t",
            "cifs",
            "-o",
            &opts,
            &source,
            &mount_point.display().to_string(),
        ])
        .await;

        // The kernel has read the credentials by now either way.
        let _ = std::fs::remove_file(&credentials_file);
        result?;

        info!(source = %source, mount_point = %mount_point.display(), "mounted CIFS share");
        Ok(())
    }

    /// Whether the path is a mount point per the OS mount table.
    pub fn is_mounted(&self, mount_point: &Path) -> StorageResult<bool> {
        let table = std::fs::read_to_string("/proc/mounts")?;
        let needle = mount_point.display().to_string();
        Ok(table
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mounted| mounted == needle))
    }

    /// Unmount the share; `lazy` detaches busy mounts.
    pub async fn unmount(&self, mount_point: &Path, lazy: bool) -> StorageResult<()> {
        let point = mount_point.display().to_string();
        let args: Vec<&str> = if lazy {
            vec!["-l", point.as_str()]
        } else {
            vec![point.as_str()]
        };

        let output = Command::new("umount").args(&args).output().await?;
        if !output.status.success() {
            return Err(StorageError::Repository {
                id: point,
                op: "unmount",
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(mount_point = %mount_point.display(), lazy, "unmounted share");
        Ok(())
    }
}

async fn run_mount(args: &[&str]) -> StorageResult<()> {
    let output = Command::new("mount").args(args).output().await?;
    if !output.status.success() {
        return Err(StorageError::Repository {
            id: args.last().unwrap_or(&"").to_string(),
            op: "mount",
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Parse a comma-separated option string, trim entries, drop empties and
/// prepend the defaults that are not already present.
fn build_share_options(options: &str) -> Vec<String> {
    let mut parsed: Vec<String> = options
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();

    for default in DEFAULT_OPTIONS.iter().rev() {
        let key = default.split('=').next().unwrap_or(default);
        let conflicting = parsed.iter().any(|o| {
            let existing = o.split('=').next().unwrap_or(o);
            existing == key || (key == "rw" && existing == "ro") || (key == "hard" && existing == "soft")
        });
        if !conflicting {
            parsed.insert(0, default.to_string());
        }
    }

    parsed
}

/// NFS options additionally carry `vers=<n>` when a version is configured.
fn build_nfs_options(options: &str, version: Option<&str>) -> String {
    let mut parsed = build_share_options(options);
    if let Some(version) = version {
        if !parsed.iter().any(|o| o.starts_with("vers=")) {
            parsed.push(format!("vers={}", version));
        }
    }
    parsed.join(",")
}

/// Write a mount.cifs credentials file readable only by root.
fn write_credentials_file(
    username: &str,
    password: &str,
    domain: Option<&str>,
) -> StorageResult<PathBuf> {
    let path = std::env::temp_dir().join(format!("haven-cifs-{}", uuid::Uuid::new_v4()));
    let mut contents = format!("username={}\npassword={}\n", username, password);
    if let Some(domain) = domain {
        contents.push_str(&format!("domain={}\n", domain));
    }

    std::fs::write(&path, contents)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_parsing_adds_defaults() {
        assert_eq!(build_share_options(""), vec!["rw", "hard"]);
        assert_eq!(
            build_share_options("noatime"),
            vec!["rw", "hard", "noatime"]
        );
    }

    #[test]
    fn test_option_parsing_trims_and_drops_empties() {
        assert_eq!(
            build_share_options(" noatime , nodiratime ,, "),
            vec!["rw", "hard", "noatime", "nodiratime"]
        );
    }

    #[test]
    fn test_explicit_options_suppress_defaults() {
        let opts = build_share_options("ro,soft");
        assert!(!opts.contains(&"rw".to_string()));
        assert!(!opts.contains(&"hard".to_string()));
        assert_eq!(opts, vec!["ro", "soft"]);
    }

    #[test]
    fn test_nfs_version_appended() {
        assert_eq!(build_nfs_options("", Some("4.1")), "rw,hard,vers=4.1");
        // An explicit vers wins.
        assert_eq!(
            build_nfs_options("vers=3", Some("4.1")),
            "rw,hard,vers=3"
        );
    }

    #[test]
    fn test_credentials_file_mode_and_content() {
        let path = write_credentials_file("svc", "s3cret", Some("CORP")).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("username=svc"));
        assert!(contents.contains("password=s3cret"));
        assert!(contents.contains("domain=CORP"));

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_is_mounted_on_root() {
        let manager = MountManager::new(None);
        // `/` is always in the mount table.
        assert!(manager.is_mounted(Path::new("/")).unwrap());
        assert!(!manager.is_mounted(Path::new("/definitely/not/mounted")).unwrap());
    }
}
