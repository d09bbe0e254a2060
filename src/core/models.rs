use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{Result, SyncError};

/// The remote protocols a target can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Webdav,
    S3,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Webdav => "webdav",
            TargetKind::S3 => "s3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webdav" => Some(TargetKind::Webdav),
            "s3" => Some(TargetKind::S3),
            _ => None,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WebDavConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl WebDavConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(SyncError::Config("webdav url is required".into()));
        }
        if self.username.is_empty() {
            return Err(SyncError::Config("webdav username is required".into()));
        }
        if self.password.is_empty() {
            return Err(SyncError::Config("webdav password is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    /// Endpoint override for S3-compatible services; `None` means AWS.
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub bucket: String,
}

impl S3Config {
    pub fn validate(&self) -> Result<()> {
        if self.access_key_id.is_empty() {
            return Err(SyncError::Config("s3 access key id is required".into()));
        }
        if self.secret_access_key.is_empty() {
            return Err(SyncError::Config("s3 secret access key is required".into()));
        }
        if self.region.is_empty() {
            return Err(SyncError::Config("s3 region is required".into()));
        }
        if self.bucket.is_empty() {
            return Err(SyncError::Config("s3 bucket is required".into()));
        }
        Ok(())
    }
}

/// Kind-specific configuration, exactly one variant per target.
#[derive(Debug, Clone)]
pub enum TargetConfig {
    Webdav(WebDavConfig),
    S3(S3Config),
}

impl TargetConfig {
    pub fn kind(&self) -> TargetKind {
        match self {
            TargetConfig::Webdav(_) => TargetKind::Webdav,
            TargetConfig::S3(_) => TargetKind::S3,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TargetConfig::Webdav(config) => config.validate(),
            TargetConfig::S3(config) => config.validate(),
        }
    }
}

/// A named remote destination with its credentials and enabled flag.
#[derive(Debug, Clone)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub kind: TargetKind,
    pub enabled: bool,
    pub config: TargetConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Terminal jobs are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOperation {
    Backup,
    Restore,
}

impl JobOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOperation::Backup => "backup",
            JobOperation::Restore => "restore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backup" => Some(JobOperation::Backup),
            "restore" => Some(JobOperation::Restore),
            _ => None,
        }
    }
}

impl fmt::Display for JobOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted backup or restore against one target. The target reference
/// is weak: jobs survive target deletion as history.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub target_id: Option<i64>,
    pub operation: JobOperation,
    pub status: JobStatus,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A job with its target's name resolved, when the target still exists.
#[derive(Debug, Clone)]
pub struct JobWithTarget {
    pub job: Job,
    pub target_name: Option<String>,
}
