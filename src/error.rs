//! Launch errors and the exit codes they map to.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::options::OptionError;

pub const EX_OK: i32 = 0;
/// Generic failure, also returned when the detached worker could not be exec'd.
pub const EX_FAILURE: i32 = 1;
/// Command line usage error.
pub const EX_USAGE: i32 = 64;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Option(#[from] OptionError),

    #[error("No such option: {option}")]
    UnrecognizedOption { option: String },

    #[error(transparent)]
    Parse(#[from] clap::Error),

    #[error("Unable to parse extra configuration from command line.\nReason: {0}")]
    ConfigOverride(#[source] ConfigError),

    #[error("Failed to load config: {0:#}")]
    Config(anyhow::Error),

    #[error("Pidfile ({}) already exists. Seems we're already running? (pid: {pid})", .path.display())]
    AlreadyRunning { path: PathBuf, pid: i32 },

    #[error("Cannot drop privileges: {0}")]
    Privileges(String),

    #[error("Failed to detach: {0:#}")]
    Detach(anyhow::Error),

    #[error("Failed to set up logging: {0:#}")]
    Logging(anyhow::Error),

    #[error("Worker failed: {0:#}")]
    Worker(anyhow::Error),
}

impl LaunchError {
    /// Errors caused by what was typed on the command line.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            LaunchError::Option(_)
                | LaunchError::UnrecognizedOption { .. }
                | LaunchError::Parse(_)
                | LaunchError::ConfigOverride(_)
        )
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_usage() {
            EX_USAGE
        } else {
            EX_FAILURE
        }
    }
}

/// Why the detached worker could not replace this process.
#[derive(Debug, Error)]
pub enum ExecFailure {
    #[error("executable {} not found", .path.display())]
    ExecutableMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("exec of {} failed", .path.display())]
    Exec {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ExecFailure {
    pub fn from_io(path: PathBuf, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            ExecFailure::ExecutableMissing { path, source }
        } else {
            ExecFailure::Exec { path, source }
        }
    }

    pub fn source_error(&self) -> &io::Error {
        match self {
            ExecFailure::ExecutableMissing { source, .. } | ExecFailure::Exec { source, .. } => source,
        }
    }
}
