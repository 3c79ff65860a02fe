//! Parsers for the individual option values.
//!
//! Every function here is pure: it takes the raw command-line text (plus, for
//! the platform check, the platform the worker would run on) and returns either
//! the typed value or an [`OptionError`] that names what was wrong. The clap
//! value parsers in [`super::OptionSpec::to_arg`] call straight into these.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::nodenames;

use super::{OptionKind, OptionSpec, OptionValue, ParsedOptions};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("Expected two comma separated integers or one integer. Got {count} instead.")]
    ArgumentCount { count: usize },

    #[error("Expected an integer. Got {value:?} instead.")]
    InvalidInteger { value: String },

    #[error("{value:?} is not one of {}", .choices.join(", "))]
    InvalidChoice {
        value: String,
        choices: Vec<&'static str>,
    },

    #[error("--{option} option does not work on {platform}. Please run it as a separate service.")]
    UnsupportedOnPlatform {
        option: &'static str,
        platform: Platform,
    },
}

/// Platform the worker is being launched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    pub fn is_windows(self) -> bool {
        self == Platform::Windows
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Unix => f.write_str("Unix"),
            Platform::Windows => f.write_str("Windows"),
        }
    }
}

/// Autoscale bounds: at most `max` and at least `min` pool processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoscalePair {
    pub max: u32,
    pub min: u32,
}

impl fmt::Display for AutoscalePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.max, self.min)
    }
}

/// `--autoscale max[,min]`. The larger of two values always becomes `max`.
pub fn parse_autoscale(raw: &str) -> Result<AutoscalePair, OptionError> {
    let tokens: Vec<&str> = raw.split(',').collect();
    if tokens.len() > 2 {
        return Err(OptionError::ArgumentCount {
            count: tokens.len(),
        });
    }

    let first = parse_count(tokens[0])?;
    match tokens.get(1) {
        None => Ok(AutoscalePair { max: first, min: 0 }),
        Some(token) => {
            let second = parse_count(token)?;
            Ok(AutoscalePair {
                max: first.max(second),
                min: first.min(second),
            })
        }
    }
}

fn parse_count(token: &str) -> Result<u32, OptionError> {
    token
        .trim()
        .parse()
        .map_err(|_| OptionError::InvalidInteger {
            value: token.to_string(),
        })
}

/// Comma separated list; empty input gives an empty list.
pub fn parse_comma_list(raw: &str) -> Result<Vec<String>, OptionError> {
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect())
}

/// `--hostname`: node name defaulting plus `%h`/`%n`/`%d` expansion.
pub fn parse_hostname(raw: &str) -> Result<String, OptionError> {
    Ok(nodenames::hostname_option(Some(raw)))
}

/// File mode creation mask, written in octal (`022` or `0o022`).
pub fn parse_umask(raw: &str) -> Result<u32, OptionError> {
    let digits = raw.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mask| *mask <= 0o777)
        .ok_or_else(|| OptionError::InvalidInteger {
            value: raw.to_string(),
        })
}

pub fn parse_log_level(raw: &str) -> Result<LogLevel, OptionError> {
    raw.parse()
}

/// Checks `value` against a fixed set of choices.
pub fn check_choice(value: &str, choices: &'static [&'static str]) -> Result<(), OptionError> {
    if choices.contains(&value) {
        Ok(())
    } else {
        Err(OptionError::InvalidChoice {
            value: value.to_string(),
            choices: choices.to_vec(),
        })
    }
}

/// A flag that cannot be honoured on Windows, such as the embedded beat scheduler.
pub fn check_restricted_flag(
    option: &'static str,
    value: bool,
    platform: Platform,
) -> Result<bool, OptionError> {
    if value && platform.is_windows() {
        return Err(OptionError::UnsupportedOnPlatform { option, platform });
    }
    Ok(value)
}

/// Runs [`check_restricted_flag`] over every restricted flag in `specs`.
pub fn check_restricted_flags(
    specs: &[OptionSpec],
    options: &ParsedOptions,
    platform: Platform,
) -> Result<(), OptionError> {
    for spec in specs.iter().filter(|s| s.kind == OptionKind::RestrictedFlag) {
        let value = options.get(spec.name).is_some_and(OptionValue::is_true);
        check_restricted_flag(spec.name, value, platform)?;
    }
    Ok(())
}

/// Worker log level, as accepted by `--loglevel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warning,
    Error,
    Critical,
    Fatal,
}

impl LogLevel {
    pub const NAMES: &'static [&'static str] =
        &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "FATAL"];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// `tracing` filter directive for this level. CRITICAL and FATAL have no
    /// tracing counterpart and map onto `error`.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical | LogLevel::Fatal => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            "FATAL" => Ok(LogLevel::Fatal),
            _ => Err(OptionError::InvalidChoice {
                value: s.to_string(),
                choices: Self::NAMES.to_vec(),
            }),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
