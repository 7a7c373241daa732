//! qemu-nbd process lifecycle.
//!
//! Each started export is tracked by port. A per-process monitor task
//! notices deaths that did not come through [`NbdProcessManager::stop`],
//! logs them and drops tracking so the port table stays truthful.

use crate::error::{NbdError, NbdResult};
use crate::ports::PortAllocator;
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Grace window between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Settle delay after process exit so the kernel releases file locks.
const LOCK_SETTLE: Duration = Duration::from_millis(100);

/// Externally visible state of a tracked process. Never carries the
/// spawn handle.
#[derive(Debug, Clone, Serialize)]
pub struct NbdProcessStatus {
    pub port: u16,
    pub export_name: String,
    pub file_path: PathBuf,
    pub pid: u32,
    pub job_id: String,
    pub vm_name: String,
    pub disk_index: i32,
    pub started_at: DateTime<Utc>,
}

struct TrackedProcess {
    status: NbdProcessStatus,
    child: Child,
}

/// Owns every `qemu-nbd` process serving an export.
pub struct NbdProcessManager {
    nbd_binary: PathBuf,
    processes: Arc<RwLock<HashMap<u16, TrackedProcess>>>,
    ports: Option<Arc<PortAllocator>>,
}

impl NbdProcessManager {
    /// Create a manager spawning the given `qemu-nbd` binary. When a port
    /// allocator is supplied, stopping a process also releases its port.
    pub fn new(nbd_binary: impl Into<PathBuf>, ports: Option<Arc<PortAllocator>>) -> Self {
        Self {
            nbd_binary: nbd_binary.into(),
            processes: Arc::new(RwLock::new(HashMap::new())),
            ports,
        }
    }

    /// Start a qemu-nbd export on a port. Refuses a port that is already
    /// tracked.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        &self,
        port: u16,
        export_name: &str,
        file_path: &Path,
        job_id: &str,
        vm_name: &str,
        disk_index: i32,
    ) -> NbdResult<NbdProcessStatus> {
        let mut processes = self.processes.write().await;
        if processes.contains_key(&port) {
            return Err(NbdError::PortBusy(port));
        }

        let child = Command::new(&self.nbd_binary)
            .args(spawn_args(port, export_name, file_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| NbdError::Process {
                op: "spawn",
                source: e,
            })?;

        let pid = child.id().unwrap_or_default();
        let status = NbdProcessStatus {
            port,
            export_name: export_name.to_string(),
            file_path: file_path.to_path_buf(),
            pid,
            job_id: job_id.to_string(),
            vm_name: vm_name.to_string(),
            disk_index,
            started_at: Utc::now(),
        };

        info!(port, pid, export = export_name, job_id, "started qemu-nbd");

        processes.insert(
            port,
            TrackedProcess {
                status: status.clone(),
                child,
            },
        );
        drop(processes);

        self.spawn_monitor(port, pid);

        Ok(status)
    }

    /// Background watcher for one process. If the process dies while still
    /// tracked (i.e. not via `stop`), log and remove tracking.
    fn spawn_monitor(&self, port: u16, pid: u32) {
        let processes = self.processes.clone();
        let ports = self.ports.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;

                let mut map = processes.write().await;
                let tracked = match map.get_mut(&port) {
                    // Stopped through the manager; nothing to watch.
                    None => return,
                    Some(t) if t.status.pid != pid => return,
                    Some(t) => t,
                };

                match tracked.child.try_wait() {
                    Ok(None) => {}
                    Ok(Some(exit)) => {
                        error!(port, pid, status = %exit, "qemu-nbd exited unexpectedly");
                        map.remove(&port);
                        drop(map);
                        if let Some(ports) = &ports {
                            ports.release(port).await;
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(port, pid, error = %e, "failed to poll qemu-nbd");
                        return;
                    }
                }
            }
        });
    }

    /// Stop the export on a port: SIGTERM, 5 s grace, then SIGKILL. The
    /// port is released through the allocator when one was supplied.
    pub async fn stop(&self, port: u16) -> NbdResult<()> {
        let mut tracked = {
            let mut processes = self.processes.write().await;
            processes
                .remove(&port)
                .ok_or(NbdError::ProcessNotFound(port))?
        };

        let pid = tracked.status.pid;
        debug!(port, pid, "stopping qemu-nbd");

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(port, pid, error = %e, "SIGTERM failed, forcing kill");
        }

        match tokio::time::timeout(STOP_GRACE, tracked.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(port, pid, status = %status, "qemu-nbd exited");
            }
            Ok(Err(e)) => {
                warn!(port, pid, error = %e, "wait on qemu-nbd failed");
            }
            Err(_) => {
                warn!(port, pid, "qemu-nbd did not exit in {:?}, killing", STOP_GRACE);
                tracked.child.kill().await.map_err(|e| NbdError::Process {
                    op: "kill",
                    source: e,
                })?;
            }
        }

        // Give the kernel a beat to release the image lock before the file
        // is reused.
        tokio::time::sleep(LOCK_SETTLE).await;

        if let Some(ports) = &self.ports {
            ports.release(port).await;
        }

        info!(port, pid, "stopped qemu-nbd");
        Ok(())
    }

    /// Stop every export owned by a job; returns the count stopped.
    pub async fn stop_by_job(&self, job_id: &str) -> NbdResult<usize> {
        let ports: Vec<u16> = {
            let processes = self.processes.read().await;
            processes
                .values()
                .filter(|t| t.status.job_id == job_id)
                .map(|t| t.status.port)
                .collect()
        };

        let mut stopped = 0;
        for port in ports {
            match self.stop(port).await {
                Ok(()) => stopped += 1,
                // Monitor may have untracked it between the scan and here.
                Err(NbdError::ProcessNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(stopped)
    }

    /// Status of the export on a port.
    pub async fn get_status(&self, port: u16) -> Option<NbdProcessStatus> {
        self.processes
            .read()
            .await
            .get(&port)
            .map(|t| t.status.clone())
    }

    /// All tracked exports.
    pub async fn get_all(&self) -> Vec<NbdProcessStatus> {
        self.processes
            .read()
            .await
            .values()
            .map(|t| t.status.clone())
            .collect()
    }

    /// Number of tracked exports.
    pub async fn count(&self) -> usize {
        self.processes.read().await.len()
    }

    /// Whether a port has a tracked export.
    pub async fn is_active(&self, port: u16) -> bool {
        self.processes.read().await.contains_key(&port)
    }
}

/// An export served by a qemu-nbd process that survived a control-plane
/// restart, parsed back out of its command line.
#[derive(Debug, Clone)]
pub struct DiscoveredExport {
    pub pid: u32,
    pub port: u16,
    pub export_name: String,
    pub file_path: PathBuf,
}

/// Scan the process table for qemu-nbd processes with our flag shape.
/// Startup recovery re-registers their ports so the rebuilt allocator
/// cannot lease a port a surviving export still serves.
pub fn discover_running(nbd_binary: &Path) -> std::io::Result<Vec<DiscoveredExport>> {
    let mut found = Vec::new();

    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };

        // Processes may exit mid-scan; unreadable entries are skipped.
        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let args: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();

        if let Some(export) = parse_export_args(pid, nbd_binary, &args) {
            found.push(export);
        }
    }

    Ok(found)
}

/// Parse one command line back into an export, matching the invocation
/// shape produced by [`spawn_args`]. Returns `None` for anything that is
/// not one of our qemu-nbd processes.
fn parse_export_args(pid: u32, nbd_binary: &Path, args: &[String]) -> Option<DiscoveredExport> {
    let argv0 = args.first()?;
    let binary_name = nbd_binary.file_name()?;
    if Path::new(argv0).file_name() != Some(binary_name) {
        return None;
    }

    let mut port = None;
    let mut export_name = None;
    for arg in &args[1..] {
        if let Some(value) = arg.strip_prefix("--port=") {
            port = value.parse::<u16>().ok();
        } else if let Some(value) = arg.strip_prefix("--export-name=") {
            export_name = Some(value.to_string());
        }
    }

    let file_path = args.last().filter(|a| !a.starts_with('-'))?;

    Some(DiscoveredExport {
        pid,
        port: port?,
        export_name: export_name?,
        file_path: PathBuf::from(file_path),
    })
}

/// Fixed qemu-nbd invocation for one export.
fn spawn_args(port: u16, export_name: &str, file_path: &Path) -> Vec<String> {
    vec![
        "-f".to_string(),
        "qcow2".to_string(),
        "--shared=10".to_string(),
        "--cache=writethrough".to_string(),
        "--bind=0.0.0.0".to_string(),
        format!("--port={}", port),
        format!("--export-name={}", export_name),
        "--persistent".to_string(),
        file_path.display().to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_args_shape() {
        let args = spawn_args(10100, "migration-vol-abc", Path::new("/tmp/r/b.qcow2"));
        assert_eq!(args[0], "-f");
        assert_eq!(args[1], "qcow2");
        assert!(args.contains(&"--shared=10".to_string()));
        assert!(args.contains(&"--cache=writethrough".to_string()));
        assert!(args.contains(&"--bind=0.0.0.0".to_string()));
        assert!(args.contains(&"--port=10100".to_string()));
        assert!(args.contains(&"--export-name=migration-vol-abc".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/r/b.qcow2");
    }

    #[test]
    fn test_parse_export_args_round_trips_spawn_args() {
        let binary = Path::new("/usr/bin/qemu-nbd");
        let mut args = vec![binary.display().to_string()];
        args.extend(spawn_args(10101, "migration-vol-6a1c", Path::new("/srv/r/b.qcow2")));

        let export = parse_export_args(4242, binary, &args).unwrap();
        assert_eq!(export.pid, 4242);
        assert_eq!(export.port, 10101);
        assert_eq!(export.export_name, "migration-vol-6a1c");
        assert_eq!(export.file_path, PathBuf::from("/srv/r/b.qcow2"));
    }

    #[test]
    fn test_parse_export_args_rejects_other_binaries() {
        let args = vec![
            "/usr/bin/qemu-img".to_string(),
            "--port=10100".to_string(),
            "--export-name=e".to_string(),
            "/srv/r/b.qcow2".to_string(),
        ];
        assert!(parse_export_args(1, Path::new("/usr/bin/qemu-nbd"), &args).is_none());
    }

    #[test]
    fn test_parse_export_args_requires_port_and_export() {
        let binary = Path::new("/usr/bin/qemu-nbd");
        let args = vec![
            "qemu-nbd".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            "/srv/r/b.qcow2".to_string(),
        ];
        assert!(parse_export_args(1, binary, &args).is_none());
    }

    #[tokio::test]
    async fn test_stop_unknown_port() {
        let manager = NbdProcessManager::new("/usr/bin/qemu-nbd", None);
        let err = manager.stop(10100).await.unwrap_err();
        assert!(matches!(err, NbdError::ProcessNotFound(10100)));
    }

    #[tokio::test]
    async fn test_queries_on_empty_manager() {
        let manager = NbdProcessManager::new("/usr/bin/qemu-nbd", None);
        assert_eq!(manager.count().await, 0);
        assert!(!manager.is_active(10100).await);
        assert!(manager.get_status(10100).await.is_none());
        assert!(manager.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_by_job_with_no_processes() {
        let manager = NbdProcessManager::new("/usr/bin/qemu-nbd", None);
        assert_eq!(manager.stop_by_job("job-x").await.unwrap(), 0);
    }
}
