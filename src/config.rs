//! Configuration for the orchestration core.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (TOKENFLOW_RETENTION_HOURS, TOKENFLOW_LEASE_SECONDS,
//!    TOKENFLOW_WAIT_TIMEOUT_MS, TOKENFLOW_EXECUTION_TIMEOUT_SECONDS)
//! 2. Config file (.tokenflow/config.yaml)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .tokenflow/config.yaml
//! - Falls back to ~/.tokenflow/config.yaml

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".tokenflow";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub orchestration: OrchestrationSettings,
}

/// Settings for the idempotency store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencySettings {
    /// How long completed records are replayable (default: 24h)
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// How long an unrenewed in-progress record blocks other executions (default: 30s)
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Interval of the background purge task (default: 5 min)
    #[serde(default = "default_purge_interval")]
    pub purge_interval_seconds: u64,
}

fn default_retention_hours() -> u64 {
    24
}
fn default_lease_seconds() -> u64 {
    30
}
fn default_purge_interval() -> u64 {
    300
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            lease_seconds: default_lease_seconds(),
            purge_interval_seconds: default_purge_interval(),
        }
    }
}

impl IdempotencySettings {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_seconds as i64)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_seconds.max(1))
    }
}

/// Settings for the orchestration pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationSettings {
    /// Executor stage timeout in seconds (default: 120)
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_seconds: u64,

    /// How long a duplicate submission waits for the running one.
    /// The default (130s) outlasts the default execution timeout.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Glob patterns of operation types that must carry an idempotency key
    #[serde(default)]
    pub require_idempotency_key: Vec<String>,
}

fn default_execution_timeout() -> u64 {
    120
}
fn default_wait_timeout_ms() -> u64 {
    130_000
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            execution_timeout_seconds: default_execution_timeout(),
            wait_timeout_ms: default_wait_timeout_ms(),
            require_idempotency_key: Vec::new(),
        }
    }
}

impl OrchestrationSettings {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Resolved configuration from all sources
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub idempotency: IdempotencySettings,
    pub orchestration: OrchestrationSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    if let Ok(mut current) = std::env::current_dir() {
        loop {
            let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
            if config_path.exists() {
                return Some(config_path);
            }

            if !current.pop() {
                break;
            }
        }
    }

    let home_config = dirs::home_dir()?.join(CONFIG_DIR).join(CONFIG_FILE);
    home_config.exists().then_some(home_config)
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", name, raw, e)),
        None => Ok(None),
    }
}

/// Apply environment overrides on top of file/default settings
fn apply_env_overrides(
    config: &mut ResolvedConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(hours) = parse_env(&lookup, "TOKENFLOW_RETENTION_HOURS")? {
        config.idempotency.retention_hours = hours;
    }
    if let Some(secs) = parse_env(&lookup, "TOKENFLOW_LEASE_SECONDS")? {
        config.idempotency.lease_seconds = secs;
    }
    if let Some(ms) = parse_env(&lookup, "TOKENFLOW_WAIT_TIMEOUT_MS")? {
        config.orchestration.wait_timeout_ms = ms;
    }
    if let Some(secs) = parse_env(&lookup, "TOKENFLOW_EXECUTION_TIMEOUT_SECONDS")? {
        config.orchestration.execution_timeout_seconds = secs;
    }
    Ok(())
}

fn resolve(config_file: Option<PathBuf>, lookup: impl Fn(&str) -> Option<String>) -> Result<ResolvedConfig> {
    let mut config = match config_file {
        Some(ref path) => {
            let file = load_config_file(path)?;
            ResolvedConfig {
                idempotency: file.idempotency,
                orchestration: file.orchestration,
                config_file: Some(path.clone()),
            }
        }
        None => ResolvedConfig::default(),
    };

    apply_env_overrides(&mut config, lookup)?;
    Ok(config)
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    resolve(find_config_file(), |name| std::env::var(name).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
