//! Rebuilds a command line from resolved options, for the detached worker.

use super::{OptionValue, ParsedOptions};

/// Options handed to the daemonizer directly instead of being re-encoded.
pub const DETACH_EXCLUDED: &[&str] = &[
    "detach",
    "logfile",
    "pidfile",
    "uid",
    "gid",
    "umask",
    "hostname",
    "executable",
];

/// Encodes `options` as `--name [value]` tokens in insertion order.
///
/// `true` becomes a bare flag, `false` and unset values are left out, and
/// everything else is written as two tokens using [`OptionValue::encode`].
pub fn reconstitute(options: &ParsedOptions) -> Vec<String> {
    let mut argv = Vec::new();
    for (name, value) in options.iter() {
        match value {
            OptionValue::Bool(true) => argv.push(format!("--{name}")),
            OptionValue::Bool(false) | OptionValue::None => {}
            other => {
                if let Some(encoded) = other.encode() {
                    argv.push(format!("--{name}"));
                    argv.push(encoded);
                }
            }
        }
    }
    argv
}
