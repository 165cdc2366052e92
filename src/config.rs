//! TOML configuration for the snapflow daemon.
//!
//! Layered: explicit path, `SNAPFLOW_CONFIG`, the system location, then
//! compiled-in defaults. Secrets may also come from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const SYSTEM_CONFIG_PATH: &str = "/etc/snapflow/snapflow.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapflowConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SnapflowConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.apply_env();
        info!(path = %path.display(), "loaded snapflow configuration");
        Ok(config)
    }

    /// Resolve the configuration for a process.
    ///
    /// An explicit path must load; the fallbacks only warn.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var("SNAPFLOW_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SNAPFLOW_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
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
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("SNAPFLOW_TRACKER_API_KEY") {
            self.tracker.api_key = Some(key);
        }
        if let Ok(password) = std::env::var("SNAPFLOW_SMTP_PASSWORD") {
            self.smtp.password = Some(password);
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: String,
    /// Script artifacts are resolved against this directory; logs go under `logs/`.
    pub media_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/snapflow.db".to_string(),
            media_root: PathBuf::from("data/media"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    /// Maximum number of executions running at once.
    pub workers: usize,
    /// Executions waiting for a worker before the poll loop applies backpressure.
    pub queue_capacity: usize,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            workers: 4,
            queue_capacity: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Program used to launch scripts. Empty runs the script path directly.
    pub interpreter: String,
    pub timeout_secs: u64,
    /// Substrings in stdout that mark a functional failure even on exit code 0.
    pub failure_markers: Vec<String>,
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            timeout_secs: 300,
            failure_markers: vec!["ERREURS_FORMULAIRES".to_string(), "❌".to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Issue tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Redmine base URL, e.g. `https://redmine.example.com`. Unset disables tickets.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub tracker_id: i64,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub description_limit: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            tracker_id: 2,
            timeout_secs: 15,
            max_attempts: 3,
            backoff_ms: 500,
            description_limit: 4000,
        }
    }
}

// ---------------------------------------------------------------------------
// SMTP
// ---------------------------------------------------------------------------

/// How the SMTP session is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Plain session upgraded with `STARTTLS` (submission, port 587).
    Starttls,
    /// TLS from the first byte (port 465).
    Implicit,
    /// Cleartext. Credentials are never sent over it.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Relay host. Unset disables notifications.
    pub host: Option<String>,
    pub port: u16,
    pub tls: SmtpTls,
    /// PEM bundle of trusted roots. Defaults to the system bundle.
    pub ca_file: Option<PathBuf>,
    pub sender: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Characters of the report quoted in the mail body.
    pub excerpt_chars: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 587,
            tls: SmtpTls::Starttls,
            ca_file: None,
            sender: "snapflow@localhost".to_string(),
            username: None,
            password: None,
            timeout_secs: 15,
            max_attempts: 3,
            backoff_ms: 500,
            excerpt_chars: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
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
