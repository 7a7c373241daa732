//! Wire types and HTTP clients for the data plane and the migration agent.
//!
//! The JSON field names are the protocol; everything else in this crate
//! treats these structs as the source of truth for what agents send.

use crate::error::{FlowError, FlowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Periodic progress update pushed by a data-mover agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryUpdate {
    pub job_id: String,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub current_phase: String,
    #[serde(default)]
    pub bytes_transferred: i64,
    #[serde(default)]
    pub total_bytes: i64,
    #[serde(default)]
    pub transfer_speed_bps: i64,
    #[serde(default)]
    pub eta_seconds: i32,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default)]
    pub disks: Vec<DiskTelemetry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TelemetryError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Per-disk progress within an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskTelemetry {
    pub disk_index: i32,
    #[serde(default)]
    pub bytes_transferred: i64,
    #[serde(default)]
    pub total_bytes: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress_percent: f64,
}

/// Error payload within an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Backup start request sent to the data plane. Replication starts carry
/// no repository; the volume service owns their destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStartRequest {
    pub vm_name: String,
    pub backup_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Response from the data plane for a backup start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStartResponse {
    pub backup_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub total_bytes: i64,
    #[serde(default)]
    pub disks: Vec<BackupDiskInfo>,
}

/// Per-disk export details in a backup start response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDiskInfo {
    pub disk_id: i32,
    pub nbd_port: u16,
    pub nbd_export_name: String,
    pub qcow2_path: String,
    #[serde(default)]
    pub status: String,
}

/// What the agent reports for one export during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentJobState {
    Running,
    Completed,
    Failed,
    NotFound,
}

/// Progress the agent reports for a job or export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProgress {
    pub state: AgentJobState,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default)]
    pub bytes_transferred: i64,
    #[serde(default)]
    pub total_bytes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Client for the data-plane API that starts backups and replications.
#[derive(Clone)]
pub struct DataPlaneClient {
    base_url: String,
    http: reqwest::Client,
}

impl DataPlaneClient {
    /// Create a client against the data-plane base URL.
    pub fn new(base_url: impl Into<String>) -> FlowResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: trim_base(base_url.into()),
            http,
        })
    }

    /// Ask the data plane to start a backup for a VM.
    pub async fn start_backup(
        &self,
        request: &BackupStartRequest,
    ) -> FlowResult<BackupStartResponse> {
        let url = format!("{}/api/v1/backups", self.base_url);
        debug!(vm_name = %request.vm_name, backup_type = %request.backup_type, "starting backup via data plane");

        let response = self.http.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            return Err(FlowError::Upstream {
                service: "data-plane",
                message: format!("{}: {}", response.status(), response.text().await.unwrap_or_default()),
            });
        }

        Ok(response.json().await?)
    }

    /// Ask the data plane to start a replication for a VM.
    pub async fn start_replication(
        &self,
        request: &BackupStartRequest,
    ) -> FlowResult<BackupStartResponse> {
        let url = format!("{}/api/v1/replications", self.base_url);
        debug!(vm_name = %request.vm_name, "starting replication via data plane");

        let response = self.http.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            return Err(FlowError::Upstream {
                service: "data-plane",
                message: format!("{}: {}", response.status(), response.text().await.unwrap_or_default()),
            });
        }

        Ok(response.json().await?)
    }
}

/// Client for the migration agent's progress API.
#[derive(Clone)]
pub struct AgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl AgentClient {
    /// Create a client against the agent base URL.
    pub fn new(base_url: impl Into<String>) -> FlowResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: trim_base(base_url.into()),
            http,
        })
    }

    /// Progress for a logical job name (export name or raw job id).
    /// A 404 is a definite `NotFound`, not an error.
    pub async fn get_progress(&self, name: &str) -> FlowResult<AgentProgress> {
        let url = format!("{}/api/v1/progress/{}", self.base_url, name);
        let response = self.http.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(AgentProgress {
                state: AgentJobState::NotFound,
                progress_percent: 0.0,
                bytes_transferred: 0,
                total_bytes: 0,
                error: None,
            });
        }

        if !response.status().is_success() {
            return Err(FlowError::Upstream {
                service: "agent",
                message: response.status().to_string(),
            });
        }

        Ok(response.json().await?)
    }
}

fn trim_base(mut base: String) -> String {
    while base.ends_with('/') {
        base.pop();
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_update_wire_format() {
        let json = r#"{
            "job_id": "backup-web01-disk0-20250101-000000",
            "job_type": "backup",
            "status": "running",
            "current_phase": "copy",
            "bytes_transferred": 524288000,
            "total_bytes": 1073741824,
            "transfer_speed_bps": 104857600,
            "eta_seconds": 5,
            "progress_percent": 48.8,
            "disks": [
                {"disk_index": 0, "bytes_transferred": 524288000,
                 "total_bytes": 1073741824, "status": "running",
                 "progress_percent": 48.8}
            ]
        }"#;

        let update: TelemetryUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.job_id, "backup-web01-disk0-20250101-000000");
        assert_eq!(update.disks.len(), 1);
        assert!(update.error.is_none());
    }

    #[test]
    fn test_telemetry_error_payload() {
        let json = r#"{"job_id": "j1", "error": {"message": "nbd write failed", "code": "EIO"}}"#;
        let update: TelemetryUpdate = serde_json::from_str(json).unwrap();
        let error = update.error.unwrap();
        assert_eq!(error.message, "nbd write failed");
        assert_eq!(error.code.as_deref(), Some("EIO"));
    }

    #[test]
    fn test_backup_start_round_trip() {
        let request = BackupStartRequest {
            vm_name: "web01".to_string(),
            backup_type: "incremental".to_string(),
            repository_id: Some("repo-primary".to_string()),
            policy_id: None,
            tags: vec![],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["vm_name"], "web01");
        assert_eq!(json["repository_id"], "repo-primary");
        assert!(json.get("policy_id").is_none());
        assert!(json.get("tags").is_none());

        let response: BackupStartResponse = serde_json::from_str(
            r#"{"backup_id": "backup-web01-disk0-20250101-000000",
                "status": "started", "total_bytes": 1073741824,
                "disks": [{"disk_id": 0, "nbd_port": 10100,
                           "nbd_export_name": "migration-vol-6a1c",
                           "qcow2_path": "/srv/r/ctx/disk-0/b.qcow2"}]}"#,
        )
        .unwrap();
        assert_eq!(response.disks[0].nbd_port, 10100);
    }

    #[test]
    fn test_base_url_trimming() {
        assert_eq!(trim_base("http://a:1/".to_string()), "http://a:1");
        assert_eq!(trim_base("http://a:1".to_string()), "http://a:1");
    }
}
