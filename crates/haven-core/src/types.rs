//! Domain enums and status vocabulary.
//!
//! Statuses are persisted as lowercase text columns; the `as_str`/`parse`
//! pairs here are the single source of truth for that mapping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of backup a job produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
    /// Defined for persistence round-trips; no execution path produces it.
    Differential,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
        }
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "differential" => Ok(BackupType::Differential),
            other => Err(format!("unknown backup type: {}", other)),
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a backup job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Cancelled => "cancelled",
        }
    }

    /// A terminal job never changes status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackupStatus::Completed | BackupStatus::Failed | BackupStatus::Cancelled
        )
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "running" => Ok(BackupStatus::Running),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            "cancelled" => Ok(BackupStatus::Cancelled),
            other => Err(format!("unknown backup status: {}", other)),
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage backend type of a repository.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    Local,
    Nfs,
    Cifs,
    S3,
    Azure,
}

impl RepositoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryType::Local => "local",
            RepositoryType::Nfs => "nfs",
            RepositoryType::Cifs => "cifs",
            RepositoryType::S3 => "s3",
            RepositoryType::Azure => "azure",
        }
    }
}

impl FromStr for RepositoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(RepositoryType::Local),
            "nfs" => Ok(RepositoryType::Nfs),
            // Both spellings appear in imported configurations.
            "cifs" | "smb" => Ok(RepositoryType::Cifs),
            "s3" => Ok(RepositoryType::S3),
            "azure" => Ok(RepositoryType::Azure),
            other => Err(format!("unknown repository type: {}", other)),
        }
    }
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a secondary-repository copy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CopyStatus {
    Pending,
    Copying,
    Verifying,
    Completed,
    Failed,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::Pending => "pending",
            CopyStatus::Copying => "copying",
            CopyStatus::Verifying => "verifying",
            CopyStatus::Completed => "completed",
            CopyStatus::Failed => "failed",
        }
    }
}

impl FromStr for CopyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CopyStatus::Pending),
            "copying" => Ok(CopyStatus::Copying),
            "verifying" => Ok(CopyStatus::Verifying),
            "completed" => Ok(CopyStatus::Completed),
            "failed" => Ok(CopyStatus::Failed),
            other => Err(format!("unknown copy status: {}", other)),
        }
    }
}

impl fmt::Display for CopyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of checksum verification on a copy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Passed,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Passed => "passed",
            VerificationStatus::Failed => "failed",
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VerificationStatus::Pending),
            "passed" => Ok(VerificationStatus::Passed),
            "failed" => Ok(VerificationStatus::Failed),
            other => Err(format!("unknown verification status: {}", other)),
        }
    }
}

/// When a copy rule fires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    Immediate,
    Scheduled,
    Manual,
}

impl CopyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyMode::Immediate => "immediate",
            CopyMode::Scheduled => "scheduled",
            CopyMode::Manual => "manual",
        }
    }
}

impl FromStr for CopyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(CopyMode::Immediate),
            "scheduled" => Ok(CopyMode::Scheduled),
            "manual" => Ok(CopyMode::Manual),
            other => Err(format!("unknown copy mode: {}", other)),
        }
    }
}

/// What a protection flow does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    Backup,
    Replication,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Backup => "backup",
            FlowType::Replication => "replication",
        }
    }
}

impl FromStr for FlowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(FlowType::Backup),
            "replication" => Ok(FlowType::Replication),
            other => Err(format!("unknown flow type: {}", other)),
        }
    }
}

/// What a protection flow targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Vm,
    Group,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Vm => "vm",
            TargetType::Group => "group",
        }
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vm" => Ok(TargetType::Vm),
            "group" => Ok(TargetType::Group),
            other => Err(format!("unknown target type: {}", other)),
        }
    }
}

/// Terminal and in-flight states of a flow execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Warning,
    Error,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Warning => "warning",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "warning" => Ok(ExecutionStatus::Warning),
            "error" => Ok(ExecutionStatus::Error),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an execution was started.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    Manual,
    Scheduled,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Manual => "manual",
            ExecutionType::Scheduled => "scheduled",
        }
    }
}

impl FromStr for ExecutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ExecutionType::Manual),
            "scheduled" => Ok(ExecutionType::Scheduled),
            other => Err(format!("unknown execution type: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_type_round_trip() {
        for ty in [BackupType::Full, BackupType::Incremental, BackupType::Differential] {
            assert_eq!(ty.as_str().parse::<BackupType>().unwrap(), ty);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!BackupStatus::Pending.is_terminal());
        assert!(!BackupStatus::Running.is_terminal());
        assert!(BackupStatus::Completed.is_terminal());
        assert!(BackupStatus::Failed.is_terminal());
        assert!(BackupStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_smb_alias() {
        assert_eq!("smb".parse::<RepositoryType>().unwrap(), RepositoryType::Cifs);
        assert_eq!("cifs".parse::<RepositoryType>().unwrap(), RepositoryType::Cifs);
    }

    #[test]
    fn test_execution_status_terminal() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Warning.is_terminal());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&BackupStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let back: BackupStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, BackupStatus::Failed);
    }
}
