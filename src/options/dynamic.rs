//! Second parse pass over the arguments the worker options did not consume.
//!
//! The worker application registers extra [`OptionSpec`]s before launch (see
//! [`crate::worker::WorkerApp::user_options`]). Their flags are parsed out of
//! the tail here; bare `key=value` tokens are handed back as configuration
//! overrides.

use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{Arg, Command};

use crate::error::LaunchError;

use super::{collect, OptionSpec, ParsedOptions};

const OVERRIDES: &str = "config-overrides";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicOptions {
    pub options: ParsedOptions,
    /// `key=value` configuration overrides, in command-line order.
    pub overrides: Vec<String>,
}

fn user_command(specs: &[OptionSpec]) -> Command {
    specs
        .iter()
        .fold(
            Command::new("user")
                .no_binary_name(true)
                .disable_help_flag(true),
            |cmd, spec| cmd.arg(spec.to_arg()),
        )
        .arg(Arg::new(OVERRIDES).num_args(1..).value_name("KEY=VALUE"))
}

pub fn parse_dynamic(specs: &[OptionSpec], tail: &[String]) -> Result<DynamicOptions, LaunchError> {
    if tail.is_empty() && specs.is_empty() {
        return Ok(DynamicOptions::default());
    }

    let matches = user_command(specs)
        .try_get_matches_from(tail)
        .map_err(|err| match err.kind() {
            ErrorKind::UnknownArgument => LaunchError::UnrecognizedOption {
                option: invalid_arg(&err),
            },
            _ => LaunchError::Parse(err),
        })?;

    Ok(DynamicOptions {
        options: collect(specs, &matches),
        overrides: matches
            .get_many::<String>(OVERRIDES)
            .map(|values| values.cloned().collect())
            .unwrap_or_default(),
    })
}

fn invalid_arg(err: &clap::Error) -> String {
    match err.get(ContextKind::InvalidArg) {
        Some(ContextValue::String(arg)) => arg.clone(),
        _ => "<unknown>".to_string(),
    }
}
