//! The worker the launcher starts, and the application that builds it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::concurrency::{self, Pool};
use crate::config::AppConfig;
use crate::daemon::Pidfile;
use crate::error::EX_OK;
use crate::options::{LogLevel, OptionSpec, ParsedOptions};

/// Everything a worker is constructed from.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSettings {
    pub hostname: String,
    #[serde(serialize_with = "serialize_pool")]
    pub pool: Pool,
    #[serde(serialize_with = "serialize_level")]
    pub loglevel: LogLevel,
    pub logfile: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub statedb: Option<PathBuf>,
    pub no_color: bool,
    /// All resolved options, static and application defined.
    pub options: ParsedOptions,
    #[serde(skip)]
    pub config: AppConfig,
}

fn serialize_pool<S: serde::Serializer>(pool: &Pool, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(pool.as_str())
}

fn serialize_level<S: serde::Serializer>(level: &LogLevel, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(level.as_str())
}

pub trait Worker {
    /// Runs until the worker shuts down; the result is the process exit code.
    fn start(&mut self) -> Result<i32>;
}

/// The application a worker belongs to.
pub trait WorkerApp {
    /// Extra options this application accepts after the worker options.
    fn user_options(&self) -> &[OptionSpec] {
        &[]
    }

    fn create_worker(&self, settings: WorkerSettings) -> Result<Box<dyn Worker>>;
}

/// Application with no tasks: its worker only holds the node until
/// interrupted.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandbyApp;

impl WorkerApp for StandbyApp {
    fn create_worker(&self, settings: WorkerSettings) -> Result<Box<dyn Worker>> {
        Ok(Box::new(StandbyWorker { settings }))
    }
}

pub struct StandbyWorker {
    settings: WorkerSettings,
}

impl Worker for StandbyWorker {
    fn start(&mut self) -> Result<i32> {
        let pidfile = self.settings.pidfile.as_deref().map(Pidfile::new);
        if let Some(pidfile) = &pidfile {
            pidfile.write_pid(std::process::id())?;
        }

        tracing::info!(
            component = "worker",
            hostname = %self.settings.hostname,
            pool = %self.settings.pool,
            options = %serde_json::to_string(&self.settings.options).unwrap_or_default(),
            "Worker ready"
        );

        let runtime = concurrency::io_runtime().context("Failed to build I/O runtime")?;
        let waited = runtime.block_on(tokio::signal::ctrl_c());

        tracing::info!(component = "worker", hostname = %self.settings.hostname, "Shutting down...");
        if let Some(pidfile) = &pidfile {
            pidfile.remove()?;
        }
        waited.context("Failed to listen for shutdown signal")?;
        Ok(EX_OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionValue;

    fn settings() -> WorkerSettings {
        let mut options = ParsedOptions::new();
        options.insert("concurrency", OptionValue::Int(2));
        WorkerSettings {
            hostname: "w1@host".into(),
            pool: Pool::Solo,
            loglevel: LogLevel::Info,
            logfile: None,
            pidfile: None,
            statedb: None,
            no_color: true,
            options,
            config: AppConfig::default(),
        }
    }

    #[test]
    fn test_settings_serialize() {
        let json = serde_json::to_value(settings()).unwrap();
        assert_eq!(json["pool"], "solo");
        assert_eq!(json["loglevel"], "INFO");
        assert_eq!(json["options"]["concurrency"], 2);
        assert!(json.get("config").is_none());
    }

    #[test]
    fn test_standby_app_has_no_user_options() {
        let app = StandbyApp;
        assert!(app.user_options().is_empty());
        assert!(app.create_worker(settings()).is_ok());
    }
}
