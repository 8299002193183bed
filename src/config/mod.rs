use crate::error::SmartError;
use crate::models::SiteId;
use crate::planner::{MAX_WINDOW_DAYS, WindowSpec};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

/// SMART API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub key: String,

    /// Transport timeout; unset means the client default (none).
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default = "default_max_window_days")]
    pub max_window_days: u32,
}

/// What to extract and how politely
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// `today` or `YYYY-MM-DD`
    #[serde(default = "default_date_end")]
    pub date_end: String,

    #[serde(default)]
    pub date_window: WindowSpec,

    #[serde(default)]
    pub sites: Vec<SiteId>,

    #[serde(default = "default_wait_period_secs")]
    pub wait_period_secs: u64,

    #[serde(default = "default_wait_cooloff_secs")]
    pub wait_cooloff_secs: u64,
}

/// DuckDB sink configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_schema")]
    pub schema: String,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://smart.example.nhs.uk/".to_string()
}
fn default_max_window_days() -> u32 {
    MAX_WINDOW_DAYS
}
fn default_date_end() -> String {
    "today".to_string()
}
fn default_wait_period_secs() -> u64 {
    1
}
fn default_wait_cooloff_secs() -> u64 {
    60
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/smart.duckdb")
}
fn default_schema() -> String {
    "main".to_string()
}
fn default_table() -> String {
    "sitrep".to_string()
}
fn default_chunk_size() -> usize {
    150
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            key: String::new(),
            timeout_secs: None,
            max_window_days: default_max_window_days(),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            date_end: default_date_end(),
            date_window: WindowSpec::default(),
            sites: Vec::new(),
            wait_period_secs: default_wait_period_secs(),
            wait_cooloff_secs: default_wait_cooloff_secs(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            schema: default_schema(),
            table: default_table(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl JobConfig {
    pub fn wait_period(&self) -> Duration {
        Duration::from_secs(self.wait_period_secs)
    }

    pub fn wait_cooloff(&self) -> Duration {
        Duration::from_secs(self.wait_cooloff_secs)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

/// `SMART__SECTION__KEY` overrides. Values stay strings: keys and site hashes
/// may be all digits with leading zeros.
fn environment() -> config::Environment {
    config::Environment::with_prefix("SMART")
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("job.sites")
}

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(environment())
            .build()
            .context("Failed to read configuration sources")?;

        cfg.try_deserialize()
            .context("Invalid configuration")
    }

    /// Settings a real run cannot start without. Planning does not need them.
    pub fn validate_for_run(&self) -> std::result::Result<(), SmartError> {
        if self.api.key.trim().is_empty() {
            return Err(SmartError::config("api.key is not set"));
        }
        if self.job.sites.is_empty() {
            return Err(SmartError::config("job.sites is empty"));
        }
        if self.sink.chunk_size == 0 {
            return Err(SmartError::config("sink.chunk_size must be positive"));
        }
        if self.api.max_window_days == 0 {
            return Err(SmartError::config("api.max_window_days must be positive"));
        }
        Ok(())
    }
}
