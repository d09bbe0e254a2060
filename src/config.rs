use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Complete configuration snapshot, immutable after load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub vaultwarden: VaultwardenConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8181 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub driver: String,
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite3".to_string(),
            dsn: "./data/syncer.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Token-signing secret consumed by the admin UI.
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultwardenConfig {
    pub data_path: PathBuf,
}

impl Default for VaultwardenConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data/vaultwarden"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between scheduled sync cycles; `<= 0` disables the timer.
    pub interval: i64,
    /// Deflate level for the backup archive, 1-9.
    pub compression_level: u32,
    /// Archive encryption password; empty disables encryption.
    pub password: String,
    /// Upload retry attempts beyond the first.
    pub max_retries: u32,
    /// Backoff base delay in seconds.
    pub retry_delay_seconds: u64,
    /// Fan-out worker cap.
    pub concurrency: usize,
    /// Days of job history to keep; `<= 0` disables retention cleanup.
    pub history_retention_days: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: 3600,
            compression_level: 6,
            password: String::new(),
            max_retries: 3,
            retry_delay_seconds: 5,
            concurrency: 3,
            history_retention_days: 0,
        }
    }
}

impl SyncConfig {
    /// The archive password, with the empty string meaning "no encryption".
    pub fn archive_password(&self) -> Option<&str> {
        if self.password.is_empty() {
            None
        } else {
            Some(&self.password)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output logs as JSON for machine parsing.
    pub json: bool,
    /// Default to DEBUG instead of INFO.
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// JSON webhook receiving job events; empty disables notifications.
    pub webhook_url: Option<String>,
    /// SMTP settings consumed by the admin layer's mailer.
    pub email: EmailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: 587,
            username: String::new(),
            password: String::new(),
            from: String::new(),
            to: String::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file. A missing file yields the
    /// defaults, matching how the daemon behaves on first run.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.driver != "sqlite3" {
            return Err(SyncError::Config(format!(
                "unsupported database driver: {}",
                self.database.driver
            )));
        }
        if !(1..=9).contains(&self.sync.compression_level) {
            return Err(SyncError::Config(format!(
                "compression level must be between 1 and 9, got {}",
                self.sync.compression_level
            )));
        }
        Ok(())
    }
}
