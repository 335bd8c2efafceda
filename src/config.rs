//! Configuration for cronlease workers.
//!
//! Settings are read from `.cronlease/cronlease.toml` and layered as
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [lease]
//! backend = "sqlite"
//! ttl_secs = 60
//! sleep_ms = 10
//! retries = 10
//!
//! [aggregation]
//! max_runtime_secs = 250
//! batch_size = 100
//! step_page_size = 1000
//!
//! [hooks]
//! lock_ttl_secs = 15
//! lock_sleep_ms = 250
//! lock_retries = 65
//! delivery_timeout_secs = 10
//!
//! [counters]
//! attributes = ["build_artifacts_size", "packages_size"]
//! lock_ttl_secs = 600
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```
//!
//! # Environment
//!
//! - `CRONLEASE_MAX_RUNTIME`: aggregation budget in seconds
//! - `CRONLEASE_LOG`: log filter, same syntax as `RUST_LOG`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregation::{AggregationMode, WorkerOptions};
use crate::lease::LockOptions;

pub const CONFIG_DIR: &str = ".cronlease";
pub const CONFIG_FILE: &str = "cronlease.toml";
pub const DB_FILE: &str = "cronlease.db";

pub const ENV_MAX_RUNTIME: &str = "CRONLEASE_MAX_RUNTIME";
pub const ENV_LOG: &str = "CRONLEASE_LOG";

/// Where exclusive leases are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackendKind {
    /// The `leases` table in the shared database. Excludes other processes.
    #[default]
    Sqlite,
    /// Process-local map. Only excludes tasks inside one process.
    Memory,
}

impl std::fmt::Display for LeaseBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseBackendKind::Sqlite => write!(f, "sqlite"),
            LeaseBackendKind::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Defaults for leases taken without a more specific section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSection {
    #[serde(default)]
    pub backend: LeaseBackendKind,
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_lease_sleep_ms")]
    pub sleep_ms: u64,
    #[serde(default = "default_lease_retries")]
    pub retries: u32,
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_lease_sleep_ms() -> u64 {
    10
}

fn default_lease_retries() -> u32 {
    10
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            backend: LeaseBackendKind::default(),
            ttl_secs: default_lease_ttl_secs(),
            sleep_ms: default_lease_sleep_ms(),
            retries: default_lease_retries(),
        }
    }
}

impl LeaseSection {
    pub fn lock_options(&self) -> LockOptions {
        LockOptions::new(Duration::from_secs(self.ttl_secs))
            .with_sleep(Duration::from_millis(self.sleep_ms))
            .with_retries(self.retries)
    }
}

/// Batch aggregator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSection {
    /// Runtime budget for one invocation
    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: u64,
    /// Aggregations loaded per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Events read per page inside one step
    #[serde(default = "default_step_page_size")]
    pub step_page_size: usize,
    #[serde(default)]
    pub mode: AggregationMode,
}

fn default_max_runtime_secs() -> u64 {
    250
}

fn default_batch_size() -> usize {
    100
}

fn default_step_page_size() -> usize {
    1000
}

impl Default for AggregationSection {
    fn default() -> Self {
        Self {
            max_runtime_secs: default_max_runtime_secs(),
            batch_size: default_batch_size(),
            step_page_size: default_step_page_size(),
            mode: AggregationMode::default(),
        }
    }
}

/// Webhook failure-state and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksSection {
    #[serde(default = "default_hook_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_hook_lock_sleep_ms")]
    pub lock_sleep_ms: u64,
    #[serde(default = "default_hook_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

fn default_hook_lock_ttl_secs() -> u64 {
    15
}

fn default_hook_lock_sleep_ms() -> u64 {
    250
}

fn default_hook_lock_retries() -> u32 {
    65
}

fn default_delivery_timeout_secs() -> u64 {
    10
}

impl Default for HooksSection {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_hook_lock_ttl_secs(),
            lock_sleep_ms: default_hook_lock_sleep_ms(),
            lock_retries: default_hook_lock_retries(),
            delivery_timeout_secs: default_delivery_timeout_secs(),
        }
    }
}

impl HooksSection {
    pub fn lock_options(&self) -> LockOptions {
        LockOptions::new(Duration::from_secs(self.lock_ttl_secs))
            .with_sleep(Duration::from_millis(self.lock_sleep_ms))
            .with_retries(self.lock_retries)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

/// Buffered counter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountersSection {
    /// Attributes that accept buffered increments
    #[serde(default = "default_counter_attributes")]
    pub attributes: Vec<String>,
    #[serde(default = "default_counter_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_lease_retries")]
    pub lock_retries: u32,
}

fn default_counter_attributes() -> Vec<String> {
    vec![
        "build_artifacts_size".to_string(),
        "packages_size".to_string(),
        "storage_size".to_string(),
    ]
}

fn default_counter_lock_ttl_secs() -> u64 {
    600
}

impl Default for CountersSection {
    fn default() -> Self {
        Self {
            attributes: default_counter_attributes(),
            lock_ttl_secs: default_counter_lock_ttl_secs(),
            lock_retries: default_lease_retries(),
        }
    }
}

impl CountersSection {
    pub fn lock_options(&self) -> LockOptions {
        LockOptions::new(Duration::from_secs(self.lock_ttl_secs)).with_retries(self.lock_retries)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter when neither `CRONLEASE_LOG` nor `RUST_LOG` is set
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// The complete cronlease.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CronleaseToml {
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub aggregation: AggregationSection,
    #[serde(default)]
    pub hooks: HooksSection,
    #[serde(default)]
    pub counters: CountersSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl CronleaseToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cronlease.toml")
    }

    /// Load `cronlease.toml` from `config_dir`, or defaults if it is missing.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize cronlease.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Aggregation budget in seconds, with the environment overriding the file.
    pub fn max_runtime_secs(&self) -> u64 {
        std::env::var(ENV_MAX_RUNTIME)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.aggregation.max_runtime_secs)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.aggregation.max_runtime_secs == 0 {
            warnings.push(
                "aggregation.max_runtime_secs is 0: every run stops after one aggregation"
                    .to_string(),
            );
        }
        if self.aggregation.batch_size == 0 {
            warnings.push("aggregation.batch_size must be at least 1".to_string());
        }
        if self.aggregation.step_page_size == 0 {
            warnings.push("aggregation.step_page_size must be at least 1".to_string());
        }
        if self.lease.ttl_secs == 0 {
            warnings.push("lease.ttl_secs is 0: leases expire immediately".to_string());
        }
        if self.hooks.lock_ttl_secs == 0 {
            warnings.push("hooks.lock_ttl_secs is 0: leases expire immediately".to_string());
        }
        if self.counters.lock_ttl_secs == 0 {
            warnings.push("counters.lock_ttl_secs is 0: leases expire immediately".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for attribute in &self.counters.attributes {
            if attribute.trim().is_empty() {
                warnings.push("Empty name in counters.attributes".to_string());
            } else if !seen.insert(attribute.as_str()) {
                warnings.push(format!(
                    "Duplicate counter attribute '{}' in counters.attributes",
                    attribute
                ));
            }
        }

        if !is_valid_log_level(&self.logging.level) {
            warnings.push(format!(
                "Invalid logging.level '{}': should be trace, debug, info, warn, error or a filter directive",
                self.logging.level
            ));
        }

        warnings
    }
}

/// A bare level or an `EnvFilter` directive list such as `cronlease=debug,info`.
fn is_valid_log_level(level: &str) -> bool {
    let level = level.trim();
    if level.is_empty() {
        return false;
    }
    level.split(',').all(|directive| {
        let severity = directive.rsplit('=').next().unwrap_or("").trim();
        matches!(
            severity.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        )
    })
}

/// Resolved configuration for one CLI invocation.
///
/// Merges settings from:
/// 1. cronlease.toml
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct CronleaseConfig {
    pub project_dir: PathBuf,
    /// Path to the .cronlease directory
    pub config_dir: PathBuf,
    pub toml: CronleaseToml,
    /// CLI override: verbose mode
    pub verbose: bool,
    /// CLI override for the database path
    pub cli_db_path: Option<PathBuf>,
    /// CLI override for the aggregation budget
    pub cli_max_runtime_secs: Option<u64>,
}

impl CronleaseConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = CronleaseToml::load_or_default(&config_dir)?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            verbose: false,
            cli_db_path: None,
            cli_max_runtime_secs: None,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        db_path: Option<PathBuf>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_db_path = db_path;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Database path (CLI → default inside .cronlease).
    pub fn db_path(&self) -> PathBuf {
        self.cli_db_path
            .clone()
            .unwrap_or_else(|| self.config_dir.join(DB_FILE))
    }

    /// Aggregation budget (CLI → env → file).
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(
            self.cli_max_runtime_secs
                .unwrap_or_else(|| self.toml.max_runtime_secs()),
        )
    }

    /// Log filter set explicitly for this run (`--verbose` → `CRONLEASE_LOG`).
    pub fn log_override(&self) -> Option<String> {
        if self.verbose {
            return Some("debug".to_string());
        }
        std::env::var(ENV_LOG).ok().filter(|v| !v.trim().is_empty())
    }

    /// Log filter (`--verbose` → env → file).
    pub fn log_level(&self) -> String {
        self.log_override()
            .unwrap_or_else(|| self.toml.logging.level.clone())
    }

    pub fn worker_options(&self, mode: Option<AggregationMode>) -> WorkerOptions {
        WorkerOptions {
            mode: mode.unwrap_or(self.toml.aggregation.mode),
            max_runtime: self.max_runtime(),
            batch_size: self.toml.aggregation.batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let toml = CronleaseToml::default();
        assert_eq!(toml.lease.backend, LeaseBackendKind::Sqlite);
        assert_eq!(toml.aggregation.max_runtime_secs, 250);
        assert_eq!(toml.aggregation.batch_size, 100);
        assert_eq!(toml.aggregation.step_page_size, 1000);
        assert_eq!(toml.hooks.lock_retries, 65);
        assert_eq!(toml.counters.lock_ttl_secs, 600);
        assert_eq!(toml.logging.format, LogFormat::Pretty);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = CronleaseToml::parse("").unwrap();
        assert_eq!(toml.aggregation.max_runtime_secs, 250);
        assert_eq!(toml.counters.attributes.len(), 3);
    }

    #[test]
    fn test_parse_partial_sections() {
        let content = r#"
[lease]
backend = "memory"

[aggregation]
max_runtime_secs = 30
mode = "full"

[hooks]
lock_retries = 3

[counters]
attributes = ["packages_size"]

[logging]
format = "json"
"#;
        let toml = CronleaseToml::parse(content).unwrap();
        assert_eq!(toml.lease.backend, LeaseBackendKind::Memory);
        assert_eq!(toml.lease.ttl_secs, 60);
        assert_eq!(toml.aggregation.max_runtime_secs, 30);
        assert_eq!(toml.aggregation.mode, AggregationMode::Full);
        assert_eq!(toml.aggregation.batch_size, 100);
        assert_eq!(toml.hooks.lock_retries, 3);
        assert_eq!(toml.hooks.lock_ttl_secs, 15);
        assert_eq!(toml.counters.attributes, vec!["packages_size".to_string()]);
        assert_eq!(toml.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_invalid_backend_fails() {
        let content = r#"
[lease]
backend = "redis"
"#;
        assert!(CronleaseToml::parse(content).is_err());
    }

    #[test]
    fn test_lock_options_from_sections() {
        let toml = CronleaseToml::default();
        let hooks = toml.hooks.lock_options();
        assert_eq!(hooks.ttl, Duration::from_secs(15));
        assert_eq!(hooks.sleep, Duration::from_millis(250));
        assert_eq!(hooks.attempts(), 66);

        let counters = toml.counters.lock_options();
        assert_eq!(counters.ttl, Duration::from_secs(600));

        assert_eq!(toml.lease.lock_options(), LockOptions::default());
    }

    #[test]
    fn test_validate_reports_problems() {
        let content = r#"
[aggregation]
batch_size = 0
step_page_size = 0

[counters]
attributes = ["size", "size", ""]

[logging]
level = "loud"
"#;
        let warnings = CronleaseToml::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 5, "{:?}", warnings);
        assert!(warnings.iter().any(|w| w.contains("batch_size")));
        assert!(warnings.iter().any(|w| w.contains("Duplicate counter attribute 'size'")));
        assert!(warnings.iter().any(|w| w.contains("Invalid logging.level 'loud'")));
    }

    #[test]
    fn test_log_level_validation() {
        assert!(is_valid_log_level("info"));
        assert!(is_valid_log_level("WARN"));
        assert!(is_valid_log_level("cronlease=debug,info"));
        assert!(!is_valid_log_level(""));
        assert!(!is_valid_log_level("verbose"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = CronleaseToml::default();
        toml.aggregation.batch_size = 7;
        toml.save(&path).unwrap();

        let loaded = CronleaseToml::load(&path).unwrap();
        assert_eq!(loaded.aggregation.batch_size, 7);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let toml = CronleaseToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.aggregation.batch_size, 100);
    }

    #[test]
    fn test_max_runtime_priority() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var(ENV_MAX_RUNTIME).ok();
        unsafe { std::env::remove_var(ENV_MAX_RUNTIME) };

        let dir = tempdir().unwrap();
        let mut config = CronleaseConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.max_runtime(), Duration::from_secs(250));

        unsafe { std::env::set_var(ENV_MAX_RUNTIME, "40") };
        assert_eq!(config.max_runtime(), Duration::from_secs(40));

        config.cli_max_runtime_secs = Some(5);
        assert_eq!(config.max_runtime(), Duration::from_secs(5));

        unsafe { std::env::remove_var(ENV_MAX_RUNTIME) };
        if let Some(val) = saved {
            unsafe { std::env::set_var(ENV_MAX_RUNTIME, val) };
        }
    }

    #[test]
    fn test_log_level_priority() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var(ENV_LOG).ok();
        unsafe { std::env::remove_var(ENV_LOG) };

        let dir = tempdir().unwrap();
        let mut config = CronleaseConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.log_override(), None);

        unsafe { std::env::set_var(ENV_LOG, "warn") };
        assert_eq!(config.log_level(), "warn");

        config.verbose = true;
        assert_eq!(config.log_level(), "debug");

        unsafe { std::env::remove_var(ENV_LOG) };
        if let Some(val) = saved {
            unsafe { std::env::set_var(ENV_LOG, val) };
        }
    }

    #[test]
    fn test_config_paths() {
        let dir = tempdir().unwrap();
        let config = CronleaseConfig::new(dir.path().to_path_buf()).unwrap();
        assert!(config.config_dir.ends_with(CONFIG_DIR));
        assert!(config.db_path().ends_with(DB_FILE));
        assert!(config.config_file().ends_with(CONFIG_FILE));

        let custom = CronleaseConfig::with_cli_args(
            dir.path().to_path_buf(),
            false,
            Some(PathBuf::from("/tmp/other.db")),
        )
        .unwrap();
        assert_eq!(custom.db_path(), PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn test_worker_options_follow_config() {
        let dir = tempdir().unwrap();
        let mut config = CronleaseConfig::new(dir.path().to_path_buf()).unwrap();
        config.toml.aggregation.batch_size = 3;
        config.cli_max_runtime_secs = Some(9);

        let options = config.worker_options(Some(AggregationMode::Full));
        assert_eq!(options.mode, AggregationMode::Full);
        assert_eq!(options.batch_size, 3);
        assert_eq!(options.max_runtime, Duration::from_secs(9));

        assert_eq!(
            config.worker_options(None).mode,
            AggregationMode::Incremental
        );
    }
}
