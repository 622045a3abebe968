//! Configuration loader and validator for the segment batch engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub platform: Platform,
    pub limits: Limits,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub sweep_interval_ms: u64,
    /// Pending jobs untouched for this long are picked up by the sweep
    /// even without an explicit resume time (crash recovery).
    pub settle_seconds: u64,
}

/// External segmentation platform settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub api_base: String,
    pub token: String,
    /// Decorative suffix the platform appends to managed segment names;
    /// stripped when matching against remote segments.
    pub branding_suffix: String,
}

/// Quota and retry policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Limits {
    /// Creation calls allowed per account per 60-second window.
    pub minute_cap: i64,
    /// Creation calls allowed per account per UTC calendar day.
    pub day_cap: i64,
    /// Attempts per task before a transient failure becomes permanent.
    pub task_attempt_limit: i64,
    /// Jobs claimed per sweep tick.
    pub sweep_batch: i64,
    /// Consecutive task failures that abort the whole job.
    pub consecutive_failure_limit: i64,
    /// Upper bound on segments accepted in one submission.
    pub max_segments_per_job: usize,
    /// Remote-segment cache older than this is refreshed before a job runs.
    pub cache_max_age_seconds: i64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sweep_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.sweep_interval_ms must be > 0"));
    }

    if cfg.platform.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("platform.api_base must be non-empty"));
    }
    if cfg.platform.token.trim().is_empty() {
        return Err(ConfigError::Invalid("platform.token must be non-empty"));
    }

    if cfg.limits.minute_cap <= 0 {
        return Err(ConfigError::Invalid("limits.minute_cap must be > 0"));
    }
    if cfg.limits.day_cap <= 0 {
        return Err(ConfigError::Invalid("limits.day_cap must be > 0"));
    }
    if cfg.limits.task_attempt_limit <= 0 {
        return Err(ConfigError::Invalid("limits.task_attempt_limit must be > 0"));
    }
    if cfg.limits.sweep_batch <= 0 {
        return Err(ConfigError::Invalid("limits.sweep_batch must be > 0"));
    }
    if cfg.limits.consecutive_failure_limit <= 0 {
        return Err(ConfigError::Invalid(
            "limits.consecutive_failure_limit must be > 0",
        ));
    }
    if cfg.limits.max_segments_per_job == 0 {
        return Err(ConfigError::Invalid(
            "limits.max_segments_per_job must be > 0",
        ));
    }

    Ok(())
}

/// Example YAML configuration, also used as a baseline in tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sweep_interval_ms: 60000
  settle_seconds: 300

platform:
  api_base: "https://api.segmind.example.com/"
  token: "YOUR_PLATFORM_API_TOKEN"
  branding_suffix: " | SegmentBatcher"

limits:
  minute_cap: 15
  day_cap: 100
  task_attempt_limit: 3
  sweep_batch: 5
  consecutive_failure_limit: 5
  max_segments_per_job: 500
  cache_max_age_seconds: 900
"#
}
