//! Arguments of the `worker` sub-command.
//!
//! The options live in one static table so the same [`OptionSpec`]s drive the
//! clap parser, the config fallbacks and the command line rebuilt for a
//! detached worker. Anything the table does not know (application options and
//! `key=value` overrides) is captured for the second parse pass; worker
//! options that show up after such tokens are still parsed here.

use clap::parser::ValueSource;
use clap::{Arg, ArgMatches, Args, Command, FromArgMatches};

use crate::concurrency::Pool;
use crate::options::{collect, OptionKind, OptionSpec, ParsedOptions};

pub const WORKER_GROUP: &str = "Worker Options";
pub const POOL_GROUP: &str = "Pool Options";
pub const QUEUE_GROUP: &str = "Queue Options";
pub const FEATURES_GROUP: &str = "Features";
pub const BEAT_GROUP: &str = "Embedded Beat Options";
pub const DAEMON_GROUP: &str = "Daemonization Options";

const EXTRA: &str = "extra";

pub const OPTIMIZATIONS: &[&str] = &["default", "fair"];

pub static WORKER_OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        short: Some('n'),
        help_group: WORKER_GROUP,
        help: "Set custom hostname (e.g., 'w1@%h'). Expands: %h (hostname), %n (name) and %d (domain).",
        ..OptionSpec::new("hostname", OptionKind::Hostname)
    },
    OptionSpec {
        short: Some('D'),
        help_group: WORKER_GROUP,
        help: "Start worker as a background process.",
        ..OptionSpec::new("detach", OptionKind::Flag)
    },
    OptionSpec {
        short: Some('S'),
        config_key: Some("worker.state_db"),
        help_group: WORKER_GROUP,
        help: "Path to the state database.",
        ..OptionSpec::new("statedb", OptionKind::Text)
    },
    OptionSpec {
        short: Some('l'),
        default: Some("WARNING"),
        help_group: WORKER_GROUP,
        help: "Logging level.",
        ..OptionSpec::new("loglevel", OptionKind::LogLevel)
    },
    OptionSpec {
        short: Some('O'),
        default: Some("default"),
        help_group: WORKER_GROUP,
        help: "Apply optimization profile.",
        ..OptionSpec::new("optimization", OptionKind::Choice(OPTIMIZATIONS))
    },
    OptionSpec {
        config_key: Some("worker.prefetch_multiplier"),
        help_group: WORKER_GROUP,
        help: "Set custom prefetch multiplier value for this worker instance.",
        ..OptionSpec::new("prefetch-multiplier", OptionKind::Int)
    },
    OptionSpec {
        short: Some('c'),
        config_key: Some("worker.concurrency"),
        help_group: POOL_GROUP,
        help: "Number of child processes processing the queue. The default is the number of CPUs available on your system.",
        ..OptionSpec::new("concurrency", OptionKind::Int)
    },
    OptionSpec {
        short: Some('P'),
        config_key: Some("worker.pool"),
        help_group: POOL_GROUP,
        help: "Pool implementation.",
        ..OptionSpec::new("pool", OptionKind::Choice(Pool::NAMES))
    },
    OptionSpec {
        short: Some('E'),
        aliases: &["events"],
        help_group: POOL_GROUP,
        help: "Send task-related events that can be captured by monitors.",
        ..OptionSpec::new("task-events", OptionKind::Flag)
    },
    OptionSpec {
        help_group: POOL_GROUP,
        help: "Enables a hard time limit (in seconds int/float) for tasks.",
        ..OptionSpec::new("time-limit", OptionKind::Float)
    },
    OptionSpec {
        help_group: POOL_GROUP,
        help: "Enables a soft time limit (in seconds int/float) for tasks.",
        ..OptionSpec::new("soft-time-limit", OptionKind::Float)
    },
    OptionSpec {
        help_group: POOL_GROUP,
        help: "Maximum number of tasks a pool worker can execute before it's terminated and replaced by a new worker.",
        ..OptionSpec::new("max-tasks-per-child", OptionKind::Int)
    },
    OptionSpec {
        help_group: POOL_GROUP,
        help: "Maximum amount of resident memory, in KiB, that may be consumed by a child process before it will be replaced by a new one.",
        ..OptionSpec::new("max-memory-per-child", OptionKind::Int)
    },
    OptionSpec {
        aliases: &["discard"],
        help_group: QUEUE_GROUP,
        help: "Purges all waiting tasks before the daemon is started.",
        ..OptionSpec::new("purge", OptionKind::Flag)
    },
    OptionSpec {
        short: Some('Q'),
        help_group: QUEUE_GROUP,
        help: "List of queues to enable for this worker, separated by comma. By default all configured queues are enabled.",
        ..OptionSpec::new("queues", OptionKind::List)
    },
    OptionSpec {
        short: Some('X'),
        help_group: QUEUE_GROUP,
        help: "List of queues to disable for this worker, separated by comma.",
        ..OptionSpec::new("exclude-queues", OptionKind::List)
    },
    OptionSpec {
        short: Some('I'),
        help_group: QUEUE_GROUP,
        help: "Comma separated list of additional modules to import.",
        ..OptionSpec::new("include", OptionKind::List)
    },
    OptionSpec {
        help_group: FEATURES_GROUP,
        help: "Don't subscribe to other workers events.",
        ..OptionSpec::new("without-gossip", OptionKind::Flag)
    },
    OptionSpec {
        help_group: FEATURES_GROUP,
        help: "Don't synchronize with other workers at start-up.",
        ..OptionSpec::new("without-mingle", OptionKind::Flag)
    },
    OptionSpec {
        help_group: FEATURES_GROUP,
        help: "Don't send event heartbeats.",
        ..OptionSpec::new("without-heartbeat", OptionKind::Flag)
    },
    OptionSpec {
        help_group: FEATURES_GROUP,
        help: "Interval in seconds at which to send worker heartbeat.",
        ..OptionSpec::new("heartbeat-interval", OptionKind::Int)
    },
    OptionSpec {
        help_group: FEATURES_GROUP,
        help: "Enable autoscaling by providing max_concurrency, min_concurrency.",
        ..OptionSpec::new("autoscale", OptionKind::Autoscale)
    },
    OptionSpec {
        short: Some('B'),
        help_group: BEAT_GROUP,
        help: "Also run the beat periodic task scheduler. Not supported on Windows.",
        ..OptionSpec::new("beat", OptionKind::RestrictedFlag)
    },
    OptionSpec {
        short: Some('s'),
        aliases: &["schedule"],
        config_key: Some("beat.schedule_filename"),
        help_group: BEAT_GROUP,
        help: "Path to the schedule database if running with the -B option.",
        ..OptionSpec::new("schedule-filename", OptionKind::Text)
    },
    OptionSpec {
        help_group: BEAT_GROUP,
        help: "Scheduler class to use.",
        ..OptionSpec::new("scheduler", OptionKind::Text)
    },
    OptionSpec {
        short: Some('f'),
        help_group: DAEMON_GROUP,
        help: "Log destination; defaults to stderr.",
        ..OptionSpec::new("logfile", OptionKind::Text)
    },
    OptionSpec {
        help_group: DAEMON_GROUP,
        help: "Pid file; checked and written when detaching.",
        ..OptionSpec::new("pidfile", OptionKind::Text)
    },
    OptionSpec {
        help_group: DAEMON_GROUP,
        help: "User name or uid to run as after startup.",
        ..OptionSpec::new("uid", OptionKind::Text)
    },
    OptionSpec {
        help_group: DAEMON_GROUP,
        help: "Group name or gid to run as after startup.",
        ..OptionSpec::new("gid", OptionKind::Text)
    },
    OptionSpec {
        help_group: DAEMON_GROUP,
        help: "File mode creation mask (octal) of the detached process.",
        ..OptionSpec::new("umask", OptionKind::Umask)
    },
    OptionSpec {
        help_group: DAEMON_GROUP,
        help: "Program to exec instead of this one when detaching.",
        ..OptionSpec::new("executable", OptionKind::Text)
    },
];

/// Parsed `worker` arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerArgs {
    /// Every option of [`WORKER_OPTIONS`], in table order.
    pub options: ParsedOptions,
    /// Tokens the table does not recognise, in command-line order.
    pub extra: Vec<String>,
}

impl FromArgMatches for WorkerArgs {
    fn from_arg_matches(matches: &ArgMatches) -> Result<Self, clap::Error> {
        let mut options = collect(WORKER_OPTIONS, matches);
        let tail: Vec<String> = matches
            .get_many::<String>(EXTRA)
            .map(|values| values.cloned().collect())
            .unwrap_or_default();

        // clap stops at the first unknown token; pick the worker options
        // back out of what follows it.
        let (late, extra) = split_tail(tail);
        if !late.is_empty() {
            let late_matches = WorkerArgs::augment_args(Command::new("worker").no_binary_name(true))
                .try_get_matches_from(&late)?;
            for spec in WORKER_OPTIONS {
                if late_matches.value_source(spec.name) == Some(ValueSource::CommandLine) {
                    options.insert(spec.name, spec.value_from(&late_matches));
                }
            }
        }

        Ok(Self { options, extra })
    }

    fn update_from_arg_matches(&mut self, matches: &ArgMatches) -> Result<(), clap::Error> {
        *self = Self::from_arg_matches(matches)?;
        Ok(())
    }
}

impl Args for WorkerArgs {
    fn augment_args(cmd: Command) -> Command {
        WORKER_OPTIONS
            .iter()
            .fold(cmd, |cmd, spec| cmd.arg(spec.to_arg()))
            .arg(
                Arg::new(EXTRA)
                    .num_args(1..)
                    .trailing_var_arg(true)
                    .allow_hyphen_values(true)
                    .value_name("ARGS")
                    .help("Application options and key=value config overrides"),
            )
    }

    fn augment_args_for_update(cmd: Command) -> Command {
        Self::augment_args(cmd)
    }
}

/// Splits captured tokens into worker option tokens (with their values) and
/// everything else. Nothing after `--` is taken.
fn split_tail(tail: Vec<String>) -> (Vec<String>, Vec<String>) {
    let mut worker = Vec::new();
    let mut rest = Vec::new();
    let mut tokens = tail.into_iter();

    while let Some(token) = tokens.next() {
        if token == "--" {
            rest.push(token);
            rest.extend(tokens.by_ref());
            break;
        }
        match worker_option(&token) {
            Some((spec, inline_value)) => {
                let takes_next = !spec.is_flag() && !inline_value;
                worker.push(token);
                if takes_next {
                    worker.extend(tokens.next());
                }
            }
            None => rest.push(token),
        }
    }
    (worker, rest)
}

/// The worker option `token` names and whether its value is attached
/// (`--pool=solo`, `-Psolo`). Short clusters such as `-DE` or `-Dc4` only
/// count when every letter up to the first valued option is known.
fn worker_option(token: &str) -> Option<(&'static OptionSpec, bool)> {
    if let Some(long) = token.strip_prefix("--") {
        let (name, inline_value) = match long.split_once('=') {
            Some((name, _)) => (name, true),
            None => (long, false),
        };
        return WORKER_OPTIONS
            .iter()
            .find(|spec| spec.name == name || spec.aliases.contains(&name))
            .map(|spec| (spec, inline_value));
    }

    let cluster = token.strip_prefix('-')?;
    let mut last_flag = None;
    for (i, c) in cluster.char_indices() {
        let spec = WORKER_OPTIONS.iter().find(|spec| spec.short == Some(c))?;
        if !spec.is_flag() {
            return Some((spec, i + c.len_utf8() < cluster.len()));
        }
        last_flag = Some(spec);
    }
    last_flag.map(|spec| (spec, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::argv::{reconstitute, DETACH_EXCLUDED};
    use crate::options::{AutoscalePair, LogLevel, OptionValue};

    fn parse(tokens: &[&str]) -> WorkerArgs {
        let matches = WorkerArgs::augment_args(Command::new("worker").no_binary_name(true))
            .try_get_matches_from(tokens)
            .unwrap();
        WorkerArgs::from_arg_matches(&matches).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.options.len(), WORKER_OPTIONS.len());
        assert_eq!(args.options.get("loglevel"), Some(&OptionValue::Level(LogLevel::Warning)));
        assert_eq!(
            args.options.get("optimization"),
            Some(&OptionValue::Str("default".into()))
        );
        assert_eq!(args.options.get("detach"), Some(&OptionValue::Bool(false)));
        assert_eq!(args.options.get("pool"), Some(&OptionValue::None));
        assert!(args
            .options
            .get("hostname")
            .and_then(OptionValue::as_str)
            .is_some_and(|h| h.starts_with("worker@")));
        assert!(args.extra.is_empty());
    }

    #[test]
    fn test_short_flags_and_aliases() {
        let args = parse(&["-c", "3", "-P", "solo", "--events", "--discard", "-Q", "a, b"]);
        assert_eq!(args.options.get("concurrency"), Some(&OptionValue::Int(3)));
        assert_eq!(args.options.get("pool"), Some(&OptionValue::Str("solo".into())));
        assert!(args.options.get("task-events").is_some_and(OptionValue::is_true));
        assert!(args.options.get("purge").is_some_and(OptionValue::is_true));
        assert_eq!(
            args.options.get("queues"),
            Some(&OptionValue::List(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cmd = || WorkerArgs::augment_args(Command::new("worker").no_binary_name(true));
        assert!(cmd().try_get_matches_from(["--pool", "threads"]).is_err());
        assert!(cmd().try_get_matches_from(["--autoscale", "1,2,3"]).is_err());
        assert!(cmd().try_get_matches_from(["-l", "verbose"]).is_err());
        assert!(cmd().try_get_matches_from(["--umask", "999"]).is_err());
    }

    #[test]
    fn test_worker_options_after_unknown_tokens() {
        let args = parse(&["--replicas", "3", "-c", "4"]);
        assert_eq!(args.options.get("concurrency"), Some(&OptionValue::Int(4)));
        assert_eq!(args.extra, vec!["--replicas", "3"]);

        let args = parse(&[
            "-c", "2", "--replicas", "3", "--pool=solo", "-DE", "-Q", "a,b", "pool=tokio", "-l", "info",
        ]);
        assert_eq!(args.options.get("concurrency"), Some(&OptionValue::Int(2)));
        assert_eq!(args.options.get("pool"), Some(&OptionValue::Str("solo".into())));
        assert!(args.options.get("detach").is_some_and(OptionValue::is_true));
        assert!(args.options.get("task-events").is_some_and(OptionValue::is_true));
        assert_eq!(
            args.options.get("queues"),
            Some(&OptionValue::List(vec!["a".into(), "b".into()]))
        );
        assert_eq!(args.options.get("loglevel"), Some(&OptionValue::Level(LogLevel::Info)));
        assert_eq!(args.extra, vec!["--replicas", "3", "pool=tokio"]);
    }

    #[test]
    fn test_late_options_keep_defaults_they_do_not_set() {
        let args = parse(&["-l", "debug", "--replicas", "3", "-Psolo"]);
        assert_eq!(args.options.get("loglevel"), Some(&OptionValue::Level(LogLevel::Debug)));
        assert_eq!(args.options.get("pool"), Some(&OptionValue::Str("solo".into())));
        assert_eq!(args.extra, vec!["--replicas", "3"]);
    }

    #[test]
    fn test_split_tail() {
        let tokens = |t: &[&str]| t.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let (worker, rest) = split_tail(tokens(&["--region", "eu", "-c", "4", "--", "-c", "5"]));
        assert_eq!(worker, vec!["-c", "4"]);
        assert_eq!(rest, vec!["--region", "eu", "--", "-c", "5"]);

        let (worker, rest) = split_tail(tokens(&["-Dc4", "-Dz", "--events", "-"]));
        assert_eq!(worker, vec!["-Dc4", "--events"]);
        assert_eq!(rest, vec!["-Dz", "-"]);
    }

    #[test]
    fn test_bad_late_value_is_a_parse_error() {
        let matches = WorkerArgs::augment_args(Command::new("worker").no_binary_name(true))
            .try_get_matches_from(["--replicas", "3", "-c", "lots"])
            .unwrap();
        assert!(WorkerArgs::from_arg_matches(&matches).is_err());
    }

    #[test]
    fn test_reconstituted_argv_reparses_to_same_options() {
        let mut original = parse(&[
            "--autoscale=10,3",
            "-c",
            "4",
            "-Q",
            "hipri,lopri",
            "--purge",
            "--time-limit",
            "30.5",
            "-l",
            "info",
            "-n",
            "w1@example.com",
            "--detach",
            "--pidfile",
            "/tmp/w1.pid",
            "--umask",
            "022",
        ])
        .options;
        assert_eq!(
            original.get("autoscale"),
            Some(&OptionValue::Autoscale(AutoscalePair { max: 10, min: 3 }))
        );
        original.extract(DETACH_EXCLUDED);

        let argv = reconstitute(&original);
        let tokens: Vec<&str> = argv.iter().map(String::as_str).collect();
        let mut reparsed = parse(&tokens).options;
        reparsed.extract(DETACH_EXCLUDED);

        assert_eq!(reparsed, original);
    }

    #[test]
    fn test_reconstitution_is_deterministic() {
        let first = parse(&["-X", "bulk", "-B", "--heartbeat-interval", "5", "-O", "fair"]).options;
        let second = parse(&["-O", "fair", "--heartbeat-interval", "5", "-B", "-X", "bulk"]).options;
        assert_eq!(reconstitute(&first), reconstitute(&second));
    }
}
