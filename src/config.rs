// ABOUTME: Configuration management for engines, schedulers and fan-out runners
// ABOUTME: Handles loading YAML configuration from files and merging environment variable overrides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Concurrency cap for workflow waves and the priority scheduler.
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    pub fail_fast: bool,

    #[serde(default, with = "humantime_serde")]
    pub workflow_timeout: Option<Duration>,

    /// Retry policy for tasks that do not declare their own.
    #[serde(default)]
    pub default_retry: Option<RetryPolicy>,

    /// Concurrent child processes for process fan-out.
    #[serde(default)]
    pub worker_pool_size: Option<usize>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

impl Config {
    /// Load configuration from file path or default locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = match path.or_else(Self::find_config_file) {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_yaml_str(&contents)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            }
            _ => Config::default(),
        };

        config.merge_env()?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let local = [
            PathBuf::from("wavefront.yaml"),
            PathBuf::from("wavefront.yml"),
            PathBuf::from(".wavefront.yaml"),
        ];

        if let Some(path) = local.into_iter().find(|p| p.exists()) {
            return Some(path);
        }

        dirs::home_dir()
            .map(|home| home.join(".wavefront").join("config.yaml"))
            .filter(|p| p.exists())
    }

    fn merge_env(&mut self) -> Result<()> {
        self.merge_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `WAVEFRONT_*` overrides read through `lookup`.
    pub fn merge_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("WAVEFRONT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("WAVEFRONT_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Some(max) = lookup("WAVEFRONT_MAX_CONCURRENCY") {
            self.max_concurrency = Some(
                max.parse()
                    .with_context(|| format!("WAVEFRONT_MAX_CONCURRENCY is not a number: {}", max))?,
            );
        }
        if let Some(fail_fast) = lookup("WAVEFRONT_FAIL_FAST") {
            self.fail_fast = parse_flag(&fail_fast)
                .with_context(|| format!("WAVEFRONT_FAIL_FAST is not a boolean: {}", fail_fast))?;
        }
        if let Some(size) = lookup("WAVEFRONT_WORKER_POOL_SIZE") {
            self.worker_pool_size = Some(
                size.parse()
                    .with_context(|| format!("WAVEFRONT_WORKER_POOL_SIZE is not a number: {}", size))?,
            );
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("unrecognised flag value '{}'", other),
    }
}
