//! Configuration loader and validator for the push scheduling engine.
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
    pub queue: Queue,
    pub apps: Vec<App>,
}

/// Queue-writer tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    /// Records buffered before a durable batch write.
    pub batch_size: usize,
}

/// Per-app settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Default timezone offset in minutes, used for users without a stored
    /// offset. Absent means UTC.
    #[serde(default)]
    pub timezone_offset: Option<i32>,
}

impl Config {
    /// Look up an app by id.
    pub fn app(&self, id: &str) -> Option<&App> {
        self.apps.iter().find(|a| a.id == id)
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
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.queue.batch_size == 0 {
        return Err(ConfigError::Invalid("queue.batch_size must be > 0"));
    }

    if cfg.apps.is_empty() {
        return Err(ConfigError::Invalid("apps must list at least one app"));
    }
    for app in &cfg.apps {
        if app.id.trim().is_empty() {
            return Err(ConfigError::Invalid("apps[].id must be non-empty"));
        }
        // UTC-12 .. UTC+14, expressed as minutes ahead of UTC
        if let Some(tz) = app.timezone_offset {
            if !(-720..=840).contains(&tz) {
                return Err(ConfigError::Invalid(
                    "apps[].timezone_offset must be within -720..=840 minutes",
                ));
            }
        }
    }
    let mut ids: Vec<&str> = cfg.apps.iter().map(|a| a.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != cfg.apps.len() {
        return Err(ConfigError::Invalid("apps[].id values must be unique"));
    }

    Ok(())
}

/// Example YAML configuration.
pub fn example() -> &'static str {
    r#"queue:
  batch_size: 500

apps:
  - id: "app1"
    name: "Demo app"
    timezone_offset: -300
  - id: "app2"
"#
}
