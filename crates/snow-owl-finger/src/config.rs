use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FingerError, Result};
use crate::privdrop::DropTarget;

/// Largest plan/project/pubkey file that will be served.
///
/// A 64 KiB limit was too small for real `.pubkey` files; 256 KiB lets a
/// user publish a little over three quarters of a megabyte across the
/// three files.
pub const DEFAULT_FILE_SIZE_LIMIT: u64 = 256 * 1024;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/snow-owl/finger.toml";

/// Finger daemon configuration
///
/// NIST 800-53 Controls:
/// - CM-6: Configuration Settings
/// - SC-5: Denial of Service Protection (timeouts, size limits)
/// - AC-6: Least Privilege (run_as_user)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerConfig {
    /// Address to bind in each family; unset binds the wildcard of each family
    pub listen_addr: Option<IpAddr>,
    pub port: u16,
    /// Alias file (`alias:target` lines); a missing file is not an error
    pub alias_file: Option<PathBuf>,
    /// Directory holding one home directory per user
    pub homes_dir: Option<PathBuf>,
    /// Identity to switch to when started as root: `uid:gid` or an account name
    pub run_as_user: Option<String>,
    pub pid_file: Option<PathBuf>,
    pub file_size_limit_bytes: u64,
    pub request_read_timeout_secs: u64,
    /// Applies to each response line, and to each served file as a whole
    pub request_write_timeout_secs: u64,
    /// Non-zero enables system account lookups for accounts at or above this uid
    pub min_account_uid: u32,
    pub logging: LoggingConfig,
}

impl Default for FingerConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            port: 79,
            alias_file: Some(PathBuf::from("/etc/finger.conf")),
            homes_dir: Some(PathBuf::from("/home")),
            run_as_user: None,
            pid_file: None,
            file_size_limit_bytes: DEFAULT_FILE_SIZE_LIMIT,
            request_read_timeout_secs: 10,
            request_write_timeout_secs: 30,
            min_account_uid: 0,
            logging: LoggingConfig::default(),
        }
    }
}

impl FingerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.request_read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.request_write_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Log file; stderr when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for SIEM integration
    Json,
}

pub fn load_config(path: &Path) -> Result<FingerConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: FingerConfig = toml::from_str(&contents)
        .map_err(|e| FingerError::Config(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &FingerConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| FingerError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate configuration for security and correctness
///
/// NIST 800-53 Controls:
/// - CM-6: Configuration Settings (validate all configuration parameters)
/// - SC-5: Denial of Service Protection (validate resource limits)
/// - AC-6: Least Privilege (refuse root as the runtime identity)
pub fn validate_config(config: &FingerConfig) -> Result<()> {
    if config.port == 0 {
        return Err(FingerError::Config("port must be non-zero".to_string()));
    }

    if config.file_size_limit_bytes == 0 {
        return Err(FingerError::Config(
            "file_size_limit_bytes must be non-zero".to_string(),
        ));
    }

    if config.request_read_timeout_secs == 0 || config.request_write_timeout_secs == 0 {
        return Err(FingerError::Config(
            "request timeouts must be non-zero".to_string(),
        ));
    }

    for (key, path) in [
        ("homes_dir", &config.homes_dir),
        ("alias_file", &config.alias_file),
        ("pid_file", &config.pid_file),
    ] {
        if let Some(path) = path
            && !path.is_absolute()
        {
            return Err(FingerError::Config(format!(
                "{} must be an absolute path",
                key
            )));
        }
    }

    if let Some(ref run_as) = config.run_as_user {
        if run_as.trim().is_empty() {
            return Err(FingerError::Config(
                "run_as_user must not be empty".to_string(),
            ));
        }
        // Account names are resolved at drop time; numeric pairs can be checked now.
        if let Some(parsed) = DropTarget::parse_numeric(run_as) {
            parsed?;
        }
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            FingerError::Config("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(FingerError::Config(
                    "logging.file parent must be a directory".to_string(),
                ));
            }
            Err(e) => {
                return Err(FingerError::Config(format!(
                    "logging.file parent error: {}",
                    e
                )));
            }
        }
    }

    Ok(())
}
