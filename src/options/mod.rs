//! Option model shared by the static worker options and the options that a
//! worker application registers at runtime.
//!
//! An [`OptionSpec`] describes one flag and knows how to turn itself into a
//! `clap::Arg` and how to read its resolved value back out of the matches.
//! Resolved values land in [`ParsedOptions`], which keeps insertion order so
//! that the argument vector rebuilt for a detached worker is deterministic.

pub mod argv;
pub mod dynamic;
pub mod validators;

use std::ffi::OsStr;

use clap::builder::{PossibleValue, TypedValueParser};
use clap::error::ErrorKind;
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::ser::{Serialize, SerializeMap, Serializer};

pub use validators::{AutoscalePair, LogLevel, OptionError, Platform};

/// Which validator an option runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Flag,
    /// Flag rejected on platforms that cannot support it (see
    /// [`validators::check_restricted_flag`]).
    RestrictedFlag,
    Text,
    Int,
    Float,
    List,
    Choice(&'static [&'static str]),
    LogLevel,
    Autoscale,
    Hostname,
    Umask,
}

/// Static description of one command-line option.
///
/// `name` doubles as the long flag and as the key in [`ParsedOptions`].
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub short: Option<char>,
    pub aliases: &'static [&'static str],
    pub kind: OptionKind,
    pub default: Option<&'static str>,
    /// App config key consulted when the option is not given.
    pub config_key: Option<&'static str>,
    /// Help heading; presentation only.
    pub help_group: &'static str,
    pub help: &'static str,
}

impl OptionSpec {
    pub const fn new(name: &'static str, kind: OptionKind) -> Self {
        Self {
            name,
            short: None,
            aliases: &[],
            kind,
            default: None,
            config_key: None,
            help_group: "Options",
            help: "",
        }
    }

    pub fn is_flag(&self) -> bool {
        matches!(self.kind, OptionKind::Flag | OptionKind::RestrictedFlag)
    }

    pub fn to_arg(&self) -> Arg {
        let mut arg = Arg::new(self.name)
            .long(self.name)
            .help(self.help)
            .help_heading(self.help_group);
        if let Some(short) = self.short {
            arg = arg.short(short);
        }
        if !self.aliases.is_empty() {
            arg = arg.visible_aliases(self.aliases.iter().copied());
        }

        arg = match self.kind {
            OptionKind::Flag | OptionKind::RestrictedFlag => arg.action(ArgAction::SetTrue),
            OptionKind::Text => arg.value_name("TEXT"),
            OptionKind::Int => arg.value_parser(clap::value_parser!(i64)).value_name("INT"),
            OptionKind::Float => arg.value_parser(clap::value_parser!(f64)).value_name("FLOAT"),
            OptionKind::List => arg.value_parser(validators::parse_comma_list).value_name("LIST"),
            OptionKind::Choice(choices) => arg.value_parser(ChoiceParser(choices)),
            OptionKind::LogLevel => arg.value_parser(validators::parse_log_level).value_name("LEVEL"),
            OptionKind::Autoscale => arg.value_parser(validators::parse_autoscale).value_name("MAX[,MIN]"),
            OptionKind::Hostname => arg.value_parser(validators::parse_hostname).value_name("HOSTNAME"),
            OptionKind::Umask => arg.value_parser(validators::parse_umask).value_name("UMASK"),
        };

        if let Some(default) = self.default {
            arg = arg.default_value(default);
        }
        arg
    }

    /// Reads this option's resolved value out of `matches`.
    pub fn value_from(&self, matches: &ArgMatches) -> OptionValue {
        let id = self.name;
        match self.kind {
            OptionKind::Flag | OptionKind::RestrictedFlag => OptionValue::Bool(matches.get_flag(id)),
            OptionKind::Text | OptionKind::Choice(_) => matches
                .get_one::<String>(id)
                .map_or(OptionValue::None, |v| OptionValue::Str(v.clone())),
            OptionKind::Hostname => OptionValue::Str(match matches.get_one::<String>(id) {
                Some(name) => name.clone(),
                None => crate::nodenames::hostname_option(None),
            }),
            OptionKind::Int => matches
                .get_one::<i64>(id)
                .map_or(OptionValue::None, |v| OptionValue::Int(*v)),
            OptionKind::Float => matches
                .get_one::<f64>(id)
                .map_or(OptionValue::None, |v| OptionValue::Float(*v)),
            OptionKind::List => matches
                .get_one::<Vec<String>>(id)
                .map_or(OptionValue::None, |v| OptionValue::List(v.clone())),
            OptionKind::LogLevel => matches
                .get_one::<LogLevel>(id)
                .map_or(OptionValue::None, |v| OptionValue::Level(*v)),
            OptionKind::Autoscale => matches
                .get_one::<AutoscalePair>(id)
                .map_or(OptionValue::None, |v| OptionValue::Autoscale(*v)),
            OptionKind::Umask => matches
                .get_one::<u32>(id)
                .map_or(OptionValue::None, |v| OptionValue::Int(i64::from(*v))),
        }
    }
}

/// Runs [`validators::check_choice`] and lists the choices in `--help`.
#[derive(Debug, Clone, Copy)]
struct ChoiceParser(&'static [&'static str]);

impl TypedValueParser for ChoiceParser {
    type Value = String;

    fn parse_ref(
        &self,
        cmd: &Command,
        arg: Option<&Arg>,
        value: &OsStr,
    ) -> Result<Self::Value, clap::Error> {
        let raw = value
            .to_str()
            .ok_or_else(|| clap::Error::new(ErrorKind::InvalidUtf8).with_cmd(cmd))?;
        validators::check_choice(raw, self.0).map_err(|e| {
            let flag = arg.map_or_else(String::new, |a| format!("--{} ", a.get_id()));
            clap::Error::raw(ErrorKind::InvalidValue, format!("{flag}{e}\n")).with_cmd(cmd)
        })?;
        Ok(raw.to_string())
    }

    fn possible_values(&self) -> Option<Box<dyn Iterator<Item = PossibleValue> + '_>> {
        Some(Box::new(self.0.iter().copied().map(PossibleValue::new)))
    }
}

/// Collects the values of `specs` from `matches`, in table order.
pub fn collect(specs: &[OptionSpec], matches: &ArgMatches) -> ParsedOptions {
    let mut options = ParsedOptions::new();
    for spec in specs {
        options.insert(spec.name, spec.value_from(matches));
    }
    options
}

/// A resolved option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
    Autoscale(AutoscalePair),
    Level(LogLevel),
}

impl OptionValue {
    pub fn is_none(&self) -> bool {
        matches!(self, OptionValue::None)
    }

    pub fn is_true(&self) -> bool {
        matches!(self, OptionValue::Bool(true))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Command-line encoding of the value, parseable by the same option's
    /// validator. `None` for values that are never written out.
    pub fn encode(&self) -> Option<String> {
        match self {
            OptionValue::None => None,
            OptionValue::Bool(b) => Some(b.to_string()),
            OptionValue::Int(v) => Some(v.to_string()),
            OptionValue::Float(v) => Some(v.to_string()),
            OptionValue::Str(s) => Some(s.clone()),
            OptionValue::List(items) => Some(items.join(",")),
            OptionValue::Autoscale(pair) => Some(pair.to_string()),
            OptionValue::Level(level) => Some(level.as_str().to_string()),
        }
    }
}

impl Serialize for OptionValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            OptionValue::None => serializer.serialize_none(),
            OptionValue::Bool(b) => serializer.serialize_bool(*b),
            OptionValue::Int(v) => serializer.serialize_i64(*v),
            OptionValue::Float(v) => serializer.serialize_f64(*v),
            OptionValue::Str(s) => serializer.serialize_str(s),
            OptionValue::List(items) => items.serialize(serializer),
            OptionValue::Autoscale(pair) => [pair.max, pair.min].serialize(serializer),
            OptionValue::Level(level) => serializer.serialize_str(level.as_str()),
        }
    }
}

/// Option name to resolved value, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOptions {
    entries: Vec<(String, OptionValue)>,
}

impl ParsedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name`, keeping its original position if it was already present.
    pub fn insert(&mut self, name: &str, value: OptionValue) {
        match self.entries.iter_mut().find(|(k, _)| k == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<OptionValue> {
        let index = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(index).1)
    }

    /// Removes every key in `names`, returning the removed entries.
    pub fn extract(&mut self, names: &[&str]) -> ParsedOptions {
        let mut taken = ParsedOptions::new();
        for name in names {
            if let Some(value) = self.remove(name) {
                taken.insert(name, value);
            }
        }
        taken
    }

    /// Appends entries from a later parse pass. Existing names win; the names
    /// that were shadowed are returned.
    pub fn merge_dynamic(&mut self, dynamic: ParsedOptions) -> Vec<String> {
        let mut shadowed = Vec::new();
        for (name, value) in dynamic.entries {
            if self.contains(&name) {
                shadowed.push(name);
            } else {
                self.entries.push((name, value));
            }
        }
        shadowed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ParsedOptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
