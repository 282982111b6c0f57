//! Chainmail configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ChainmailError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChainmailConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ChainmailConfig {
    /// Load config from the default path (~/.chainmail/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChainmailError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ChainmailError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ChainmailError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Chainmail home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chainmail")
    }
}

/// Chain scheduling policy.
///
/// All timing knobs for the merge algorithm live here so they can be tuned
/// per deployment instead of being baked into the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Width of the per-user merge window in seconds. Triggers landing inside
    /// the window fold into the existing chain; each one slides the window
    /// forward by this much.
    #[serde(default = "default_merge_window_secs")]
    pub merge_window_secs: u64,
    /// Fixed spacing between consecutive chain steps, in seconds. The first
    /// step fires one interval after the trigger.
    #[serde(default = "default_step_interval_secs")]
    pub step_interval_secs: u64,
    /// Delivery attempt budget per queued email.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed backoff between delivery retries, in seconds.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// How often the delay-queue worker checks for due jobs, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_merge_window_secs() -> u64 { 300 }
fn default_step_interval_secs() -> u64 { 60 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_backoff_secs() -> u64 { 5 }
fn default_poll_interval_secs() -> u64 { 1 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            merge_window_secs: default_merge_window_secs(),
            step_interval_secs: default_step_interval_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// SMTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Address the chain emails are sent from.
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_smtp_host() -> String { "smtp.gmail.com".into() }
fn default_smtp_port() -> u16 { 587 }

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            display_name: None,
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String { "127.0.0.1".into() }
fn default_gateway_port() -> u16 { 3333 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

/// On-disk storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the ledger and catalog databases.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    ChainmailConfig::home_dir()
        .join("data")
        .to_string_lossy()
        .into_owned()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// Path of the job-ledger database.
    pub fn ledger_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("ledger.db")
    }

    /// Path of the template-catalog database.
    pub fn catalog_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("catalog.db")
    }
}
