//! Configuration management.
//!
//! Loads configuration from an optional TOML file, then applies environment
//! variable overrides (a `.env` file is read first when present).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Integration token for the remote content API
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Timeout of a single remote call attempt
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Total attempts per call, first try included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Upper bound on time spent retrying one call
    #[serde(default = "default_max_retry_secs")]
    pub max_retry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_dump_root")]
    pub dump_root: PathBuf,

    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,

    /// Externally reachable prefix under which `dump_root` is served
    #[serde(default = "default_static_base_url")]
    pub static_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Crontab pattern, 5 fields (minute first) or 6 fields (second first)
    #[serde(default = "default_cron")]
    pub cron: String,

    /// IANA time zone the pattern is evaluated in
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Pages dumped on every tick
    #[serde(default)]
    pub page_ids: Vec<String>,

    /// Skip a tick's submissions while the dump pool is saturated
    #[serde(default)]
    pub skip_if_busy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_workers")]
    pub max_dump: usize,

    #[serde(default = "default_max_workers")]
    pub max_migrate: usize,

    /// Optional wall-clock limit for a single job
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

// Default values
fn default_base_url() -> String {
    "https://api.notion.com/v1".to_string()
}

fn default_api_version() -> String {
    "2022-06-28".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    600
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_max_retry_secs() -> u64 {
    120
}

fn default_dump_root() -> PathBuf {
    PathBuf::from("./_dumps")
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("./_history")
}

fn default_static_base_url() -> String {
    "http://127.0.0.1:8000/files".to_string()
}

fn default_cron() -> String {
    "0 * * * *".to_string()
}

fn default_timezone() -> String {
    "Asia/Seoul".to_string()
}

fn default_max_workers() -> usize {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            base_url: default_base_url(),
            api_version: default_api_version(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retry_secs: default_max_retry_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dump_root: default_dump_root(),
            history_dir: default_history_dir(),
            static_base_url: default_static_base_url(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
            timezone: default_timezone(),
            page_ids: Vec::new(),
            skip_if_busy: false,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_dump: default_max_workers(),
            max_migrate: default_max_workers(),
            deadline_secs: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            storage: StorageConfig::default(),
            schedule: ScheduleConfig::default(),
            jobs: JobsConfig::default(),
            log: LogConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl RemoteConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl JobsConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    /// File (if any) first, then `.env` and process environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = std::env::var("CONFIG_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./config.toml"));
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.trim().parse().ok())
        }

        if let Some(v) = get("NOTION_TOKEN") {
            self.remote.token = v;
        }
        if let Some(v) = get("REMOTE_BASE_URL") {
            self.remote.base_url = v;
        }
        if let Some(v) = parsed(get("REMOTE_TIMEOUT_SECS")) {
            self.remote.timeout_secs = v;
        }
        if let Some(v) = parsed(get("REMOTE_MAX_ATTEMPTS")) {
            self.remote.max_attempts = v;
        }
        if let Some(v) = get("DUMP_ROOT") {
            self.storage.dump_root = PathBuf::from(v);
        }
        if let Some(v) = get("HISTORY_DIR") {
            self.storage.history_dir = PathBuf::from(v);
        }
        if let Some(v) = get("STATIC_BASE_URL") {
            self.storage.static_base_url = v;
        }
        if let Some(v) = get("CRON") {
            self.schedule.cron = v;
        }
        if let Some(v) = get("CRON_TIMEZONE") {
            self.schedule.timezone = v;
        }
        if let Some(v) = parsed(get("SKIP_IF_BUSY")) {
            self.schedule.skip_if_busy = v;
        }
        if let Some(v) = parsed(get("MAX_DUMP_JOBS")) {
            self.jobs.max_dump = v;
        }
        if let Some(v) = parsed(get("MAX_MIGRATE_JOBS")) {
            self.jobs.max_migrate = v;
        }
        if let Some(v) = parsed(get("JOB_DEADLINE_SECS")) {
            self.jobs.deadline_secs = Some(v);
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = parsed(get("PORT")) {
            self.server.port = v;
        }

        // The list key replaces the file's list; the legacy single key is merged on top.
        let mut ids = match get("AUTO_DUMP_PAGE_IDS") {
            Some(v) => split_id_list(&v),
            None => self
                .schedule
                .page_ids
                .iter()
                .flat_map(|item| split_id_list(item))
                .collect(),
        };
        if let Some(v) = get("AUTO_DUMP_PAGE_ID") {
            ids.extend(split_id_list(&v));
        }
        self.schedule.page_ids = dedup_preserving_order(ids);
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs.max_dump == 0 || self.jobs.max_migrate == 0 {
            return Err(EngineError::Config(
                "max_dump and max_migrate must be at least 1".into(),
            ));
        }
        if self.remote.max_attempts == 0 {
            return Err(EngineError::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Split `"a,b  c"` style lists into `["a", "b", "c"]`.
pub fn split_id_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}
