//! Configuration management.
//!
//! seedr configuration can come from:
//! - Environment variables (SEEDR_*)
//! - Config file (~/.config/seedr/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// seedr configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// How often agents are refreshed; an agent whose `last_checked` is
    /// older than this is considered outdated.
    #[serde(default = "default_agent_poll_minutes")]
    pub agent_poll_minutes: i64,

    /// Agents unseen for longer than this are forgotten.
    #[serde(default = "default_unseen_agent_forget_hours")]
    pub unseen_agent_forget_hours: i64,

    /// Tolerance in bytes added to the target datadir free-space check.
    #[serde(default = "default_seed_acceptable_bytes_diff")]
    pub seed_acceptable_bytes_diff: i64,

    /// Per-stage retry budget before a seed fails terminally.
    #[serde(default = "default_max_seed_retries_per_stage")]
    pub max_seed_retries_per_stage: u32,

    /// Seed scheduler tick interval.
    #[serde(default = "default_seed_process_seconds")]
    pub seed_process_seconds: u64,

    /// Per-call deadline for agent HTTP requests.
    #[serde(default = "default_agent_http_timeout_seconds")]
    pub agent_http_timeout_seconds: u64,

    /// Bound on `read_recent_seeds`.
    #[serde(default = "default_recent_seeds_limit")]
    pub recent_seeds_limit: usize,

    /// Topology MySQL login used for the attach-replica step.
    #[serde(default)]
    pub mysql_topology_user: String,

    #[serde(default)]
    pub mysql_topology_password: String,

    /// Query run against the source MySQL that returns one
    /// (username, password) row used for CHANGE MASTER.
    #[serde(default)]
    pub replication_credentials_query: String,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_poll_minutes: default_agent_poll_minutes(),
            unseen_agent_forget_hours: default_unseen_agent_forget_hours(),
            seed_acceptable_bytes_diff: default_seed_acceptable_bytes_diff(),
            max_seed_retries_per_stage: default_max_seed_retries_per_stage(),
            seed_process_seconds: default_seed_process_seconds(),
            agent_http_timeout_seconds: default_agent_http_timeout_seconds(),
            recent_seeds_limit: default_recent_seeds_limit(),
            mysql_topology_user: String::new(),
            mysql_topology_password: String::new(),
            replication_credentials_query: String::new(),
            storage: StorageConfig::default(),
        }
    }
}

fn default_agent_poll_minutes() -> i64 {
    60
}

fn default_unseen_agent_forget_hours() -> i64 {
    24
}

fn default_seed_acceptable_bytes_diff() -> i64 {
    8192
}

fn default_max_seed_retries_per_stage() -> u32 {
    2
}

fn default_seed_process_seconds() -> u64 {
    10
}

fn default_agent_http_timeout_seconds() -> u64 {
    10
}

fn default_recent_seeds_limit() -> usize {
    100
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("seedr"))
            .unwrap_or_else(|| PathBuf::from(".seedr"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("seedr"))
            .unwrap_or_else(|| PathBuf::from(".seedr"))
    }

    /// Resolved SQLite path.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("seedr.db"))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<i64>("SEEDR_AGENT_POLL_MINUTES") {
            self.agent_poll_minutes = v;
        }
        if let Some(v) = env_parse::<i64>("SEEDR_UNSEEN_AGENT_FORGET_HOURS") {
            self.unseen_agent_forget_hours = v;
        }
        if let Some(v) = env_parse::<i64>("SEEDR_SEED_ACCEPTABLE_BYTES_DIFF") {
            self.seed_acceptable_bytes_diff = v;
        }
        if let Some(v) = env_parse::<u32>("SEEDR_MAX_SEED_RETRIES_PER_STAGE") {
            self.max_seed_retries_per_stage = v;
        }
        if let Some(v) = env_parse::<u64>("SEEDR_SEED_PROCESS_SECONDS") {
            self.seed_process_seconds = v;
        }
        if let Some(v) = env_parse::<u64>("SEEDR_AGENT_HTTP_TIMEOUT_SECONDS") {
            self.agent_http_timeout_seconds = v;
        }
        if let Ok(user) = std::env::var("SEEDR_MYSQL_TOPOLOGY_USER") {
            self.mysql_topology_user = user;
        }
        if let Ok(password) = std::env::var("SEEDR_MYSQL_TOPOLOGY_PASSWORD") {
            self.mysql_topology_password = password;
        }
        if let Ok(query) = std::env::var("SEEDR_REPLICATION_CREDENTIALS_QUERY") {
            self.replication_credentials_query = query;
        }
        if let Ok(path) = std::env::var("SEEDR_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(v) = partial.agent_poll_minutes {
            self.agent_poll_minutes = v;
        }
        if let Some(v) = partial.unseen_agent_forget_hours {
            self.unseen_agent_forget_hours = v;
        }
        if let Some(v) = partial.seed_acceptable_bytes_diff {
            self.seed_acceptable_bytes_diff = v;
        }
        if let Some(v) = partial.max_seed_retries_per_stage {
            self.max_seed_retries_per_stage = v;
        }
        if let Some(v) = partial.seed_process_seconds {
            self.seed_process_seconds = v;
        }
        if let Some(v) = partial.agent_http_timeout_seconds {
            self.agent_http_timeout_seconds = v;
        }
        if let Some(v) = partial.recent_seeds_limit {
            self.recent_seeds_limit = v;
        }
        if let Some(v) = partial.mysql_topology_user {
            self.mysql_topology_user = v;
        }
        if let Some(v) = partial.mysql_topology_password {
            self.mysql_topology_password = v;
        }
        if let Some(v) = partial.replication_credentials_query {
            self.replication_credentials_query = v;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    agent_poll_minutes: Option<i64>,
    unseen_agent_forget_hours: Option<i64>,
    seed_acceptable_bytes_diff: Option<i64>,
    max_seed_retries_per_stage: Option<u32>,
    seed_process_seconds: Option<u64>,
    agent_http_timeout_seconds: Option<u64>,
    recent_seeds_limit: Option<usize>,
    mysql_topology_user: Option<String>,
    mysql_topology_password: Option<String>,
    replication_credentials_query: Option<String>,
    storage: Option<StorageConfig>,
}
