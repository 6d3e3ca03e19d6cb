//! TOML configuration for speedwarden.
//!
//! Layered: compiled-in defaults, overridden by a TOML file found via
//! `--config`, the `SPEEDWARDEN_CONFIG` environment variable, or the standard
//! system location.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scheduler::{ScheduleConfig, DEFAULT_MIN_INTERVAL_SECS};

pub const CONFIG_ENV_VAR: &str = "SPEEDWARDEN_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/speedwarden/speedwarden.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// An explicit path must load. Without one, try `SPEEDWARDEN_CONFIG`,
    /// then the system path, then defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SPEEDWARDEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
    /// Client addresses allowed to change the schedule.
    pub admin_addresses: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
            admin_addresses: vec!["127.0.0.1".to_string(), "::1".to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/speedwarden.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Interval used when no schedule has been saved yet.
    pub default_interval_secs: u64,
    /// Floor for any configured interval.
    pub min_interval_secs: u64,
    /// Minimum spacing between manually triggered runs.
    pub cooldown_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            default_interval_secs: 3600,
            min_interval_secs: DEFAULT_MIN_INTERVAL_SECS,
            cooldown_secs: 300,
        }
    }
}

impl ScheduleSettings {
    pub fn default_schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            interval_secs: self.default_interval_secs,
            server_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Path (or bare command name resolved via `$PATH`) to the Ookla CLI.
    pub path: String,
    /// Appended to every invocation, e.g. `--interface=eth0`.
    pub extra_args: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: "speedtest".to_string(),
            extra_args: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: "https://www.speedtest.net/api/js/servers?engine=js&https_functional=true"
                .to_string(),
            timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level, used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.server.bind, "0.0.0.0:5000");
        assert_eq!(cfg.server.admin_addresses, vec!["127.0.0.1", "::1"]);
        assert_eq!(cfg.storage.database_path, PathBuf::from("data/speedwarden.db"));
        assert_eq!(cfg.schedule.default_interval_secs, 3600);
        assert_eq!(cfg.schedule.min_interval_secs, 300);
        assert_eq!(cfg.schedule.cooldown_secs, 300);
        assert_eq!(cfg.probe.path, "speedtest");
        assert!(cfg.probe.extra_args.is_empty());
        assert_eq!(cfg.directory.timeout_secs, 10);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Text);

        // Default interval must satisfy the default floor.
        assert!(cfg
            .schedule
            .default_schedule()
            .validate(cfg.schedule.min_interval_secs)
            .is_ok());
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[server]
bind = "127.0.0.1:8080"
admin_addresses = ["10.0.0.5"]

[storage]
database_path = "/var/lib/speedwarden/state.db"

[schedule]
default_interval_secs = 1800
min_interval_secs = 600
cooldown_secs = 120

[probe]
path = "/usr/bin/speedtest"
extra_args = ["--interface=eth0"]

[directory]
url = "http://localhost:9000/servers"
timeout_secs = 3

[logging]
level = "debug"
format = "json"
"#;

        let cfg: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.server.bind, "127.0.0.1:8080");
        assert_eq!(cfg.server.admin_addresses, vec!["10.0.0.5"]);
        assert_eq!(
            cfg.storage.database_path,
            PathBuf::from("/var/lib/speedwarden/state.db")
        );
        assert_eq!(cfg.schedule.default_interval_secs, 1800);
        assert_eq!(cfg.schedule.min_interval_secs, 600);
        assert_eq!(cfg.schedule.cooldown_secs, 120);
        assert_eq!(cfg.probe.path, "/usr/bin/speedtest");
        assert_eq!(cfg.probe.extra_args, vec!["--interface=eth0"]);
        assert_eq!(cfg.directory.url, "http://localhost:9000/servers");
        assert_eq!(cfg.directory.timeout_secs, 3);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[schedule]
cooldown_secs = 60
"#;

        let cfg: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.schedule.cooldown_secs, 60);
        assert_eq!(cfg.schedule.min_interval_secs, 300);
        assert_eq!(cfg.server.bind, "0.0.0.0:5000");
        assert_eq!(cfg.probe.path, "speedtest");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("speedwarden.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "0.0.0.0:9999"
"#,
        )
        .unwrap();

        let cfg = AppConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:9999");
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let result = AppConfig::resolve(Some(Path::new("/nonexistent/speedwarden.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let result: Result<AppConfig, _> = toml::from_str("[logging]\nformat = \"xml\"\n");
        assert!(result.is_err());
    }
}
