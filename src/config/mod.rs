use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::concurrency::Pool;
use crate::options::OptionValue;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub beat: BeatConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    pub base_dir: Option<String>,
}

impl PathsConfig {
    pub fn base_dir(&self) -> PathBuf {
        if let Some(ref base) = self.base_dir {
            PathBuf::from(base)
        } else {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".worker")
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base_dir().join("config.toml")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Pool processes; defaults to the number of CPUs.
    #[serde(default = "default_concurrency")]
    pub concurrency: i64,
    #[serde(default = "default_prefetch_multiplier")]
    pub prefetch_multiplier: i64,
    #[serde(default = "default_pool")]
    pub pool: String,
    #[serde(default)]
    pub state_db: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            prefetch_multiplier: default_prefetch_multiplier(),
            pool: default_pool(),
            state_db: None,
        }
    }
}

fn default_concurrency() -> i64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(1)
}

fn default_prefetch_multiplier() -> i64 {
    4
}

fn default_pool() -> String {
    Pool::default().as_str().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeatConfig {
    #[serde(default = "default_schedule_filename")]
    pub schedule_filename: String,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            schedule_filename: default_schedule_filename(),
        }
    }
}

fn default_schedule_filename() -> String {
    "beat-schedule".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("expected key=value, got {0:?}")]
    Malformed(String),

    #[error("unknown setting {0:?}")]
    UnknownKey(String),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl AppConfig {
    /// Loads `path` if given, otherwise the default config file when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_file = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default_file = PathsConfig::default().config_file();
                if !default_file.exists() {
                    return Ok(Self::default());
                }
                default_file
            }
        };

        let content = std::fs::read_to_string(&config_file)
            .with_context(|| format!("Failed to read config file {}", config_file.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Value of a setting as an option fallback.
    pub fn lookup(&self, key: &str) -> Option<OptionValue> {
        match normalize_key(key).as_str() {
            "worker.concurrency" => Some(OptionValue::Int(self.worker.concurrency)),
            "worker.prefetch_multiplier" => Some(OptionValue::Int(self.worker.prefetch_multiplier)),
            "worker.pool" => Some(OptionValue::Str(self.worker.pool.clone())),
            "worker.state_db" => self.worker.state_db.clone().map(OptionValue::Str),
            "beat.schedule_filename" => Some(OptionValue::Str(self.beat.schedule_filename.clone())),
            _ => None,
        }
    }

    /// Sets one setting from its command-line text. Keys without a section
    /// belong to `worker`.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<(), ConfigError> {
        let key = normalize_key(key);
        match key.as_str() {
            "worker.concurrency" => self.worker.concurrency = parse_int(&key, raw)?,
            "worker.prefetch_multiplier" => self.worker.prefetch_multiplier = parse_int(&key, raw)?,
            "worker.pool" => {
                let pool: Pool = raw.parse().map_err(|e: crate::options::OptionError| {
                    ConfigError::InvalidValue {
                        key: key.clone(),
                        value: raw.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                self.worker.pool = pool.as_str().to_string();
            }
            "worker.state_db" => self.worker.state_db = Some(raw.to_string()),
            "beat.schedule_filename" => self.beat.schedule_filename = raw.to_string(),
            _ => return Err(ConfigError::UnknownKey(key)),
        }
        Ok(())
    }

    /// Applies `key=value` tokens left over on the command line.
    pub fn apply_cmdline(&mut self, overrides: &[String]) -> Result<(), ConfigError> {
        for token in overrides {
            let (key, value) = token
                .split_once('=')
                .filter(|(key, _)| !key.trim().is_empty())
                .ok_or_else(|| ConfigError::Malformed(token.clone()))?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }
}

fn normalize_key(key: &str) -> String {
    let key = key.trim().to_ascii_lowercase().replace('-', "_");
    if key.contains('.') {
        key
    } else {
        format!("worker.{key}")
    }
}

fn parse_int(key: &str, raw: &str) -> Result<i64, ConfigError> {
    raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.worker.concurrency >= 1);
        assert_eq!(config.worker.prefetch_multiplier, 4);
        assert_eq!(config.lookup("worker.pool"), Some(OptionValue::Str("prefork".into())));
        assert_eq!(config.lookup("worker.state_db"), None);
        assert_eq!(
            config.lookup("beat.schedule_filename"),
            Some(OptionValue::Str("beat-schedule".into()))
        );
    }

    #[test]
    fn test_set_with_and_without_section() {
        let mut config = AppConfig::default();
        config.set("prefetch_multiplier", "8").unwrap();
        config.set("worker.concurrency", "3").unwrap();
        config.set("beat.schedule_filename", "/tmp/sched").unwrap();
        assert_eq!(config.worker.prefetch_multiplier, 8);
        assert_eq!(config.lookup("concurrency"), Some(OptionValue::Int(3)));
        assert_eq!(config.beat.schedule_filename, "/tmp/sched");
    }

    #[test]
    fn test_set_rejects_bad_input() {
        let mut config = AppConfig::default();
        assert_eq!(
            config.set("broker_url", "amqp://"),
            Err(ConfigError::UnknownKey("worker.broker_url".into()))
        );
        assert!(matches!(
            config.set("concurrency", "lots"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set("pool", "threads"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_apply_cmdline() {
        let mut config = AppConfig::default();
        config
            .apply_cmdline(&["pool=solo".to_string(), "worker.state_db=/var/w.db".to_string()])
            .unwrap();
        assert_eq!(config.worker.pool, "solo");
        assert_eq!(config.worker.state_db.as_deref(), Some("/var/w.db"));

        assert_eq!(
            config.apply_cmdline(&["loose".to_string()]),
            Err(ConfigError::Malformed("loose".into()))
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[worker]\nconcurrency = 2\npool = \"tokio\"\n\n[beat]\nschedule_filename = \"s.db\"\n",
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.worker.pool, "tokio");
        assert_eq!(config.worker.prefetch_multiplier, 4);
        assert_eq!(config.beat.schedule_filename, "s.db");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
