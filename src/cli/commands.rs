use anyhow::Context;
use std::path::{Path, PathBuf};

use crate::concurrency::{self, Pool};
use crate::config::AppConfig;
use crate::daemon::{self, DetachRequest};
use crate::error::LaunchError;
use crate::logging;
use crate::nodenames;
use crate::options::argv::{reconstitute, DETACH_EXCLUDED};
use crate::options::dynamic::parse_dynamic;
use crate::options::validators::check_restricted_flags;
use crate::options::{LogLevel, OptionSpec, OptionValue, ParsedOptions, Platform};
use crate::worker::{WorkerApp, WorkerSettings};

use super::args::{WorkerArgs, WORKER_OPTIONS};
use super::Cli;

/// Invocation-wide facts the `worker` command needs besides its own options.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub platform: Platform,
    /// Program to re-exec when detaching.
    pub executable: PathBuf,
    pub config_path: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub no_color: bool,
    pub fake_fork: bool,
}

impl LaunchContext {
    pub fn from_cli(cli: &Cli, argv0: &str) -> Self {
        Self {
            platform: Platform::current(),
            executable: std::env::current_exe().unwrap_or_else(|_| PathBuf::from(argv0)),
            config_path: cli.config.clone(),
            workdir: cli.workdir.clone(),
            no_color: cli.no_color,
            fake_fork: daemon::fake_fork_requested(),
        }
    }

    /// Global options the detached worker needs to see the same config.
    fn forwarded_globals(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(config) = &self.config_path {
            argv.push("--config".to_string());
            argv.push(absolute(config).display().to_string());
        }
        if self.no_color {
            argv.push("--no-color".to_string());
        }
        argv
    }
}

/// What `worker` decided to do with the resolved options.
#[derive(Debug)]
pub enum Launch {
    Detach(DetachRequest),
    Inline {
        settings: WorkerSettings,
        uid: Option<String>,
        gid: Option<String>,
    },
}

pub fn worker(args: WorkerArgs, app: &dyn WorkerApp, ctx: &LaunchContext) -> Result<i32, LaunchError> {
    let config = AppConfig::load(ctx.config_path.as_deref()).map_err(LaunchError::Config)?;

    match prepare(args, config, app, ctx)? {
        Launch::Detach(request) => daemon::detach(&request),
        Launch::Inline { settings, uid, gid } => run_inline(settings, uid, gid, app, ctx),
    }
}

/// Resolves every option and decides between detaching and running inline.
/// All usage errors surface here, before anything forks or starts.
pub fn prepare(
    args: WorkerArgs,
    mut config: AppConfig,
    app: &dyn WorkerApp,
    ctx: &LaunchContext,
) -> Result<Launch, LaunchError> {
    let WorkerArgs { mut options, extra } = args;

    let dynamic = parse_dynamic(app.user_options(), &extra)?;
    for name in options.merge_dynamic(dynamic.options) {
        // logging is not set up yet
        eprintln!("Warning: application option --{name} is shadowed by the worker option of the same name");
    }

    check_restricted_flags(WORKER_OPTIONS, &options, ctx.platform)?;
    check_restricted_flags(app.user_options(), &options, ctx.platform)?;

    config
        .apply_cmdline(&dynamic.overrides)
        .map_err(LaunchError::ConfigOverride)?;
    apply_config_fallbacks(WORKER_OPTIONS, &mut options, &config);

    let pool: Pool = options
        .get("pool")
        .and_then(OptionValue::as_str)
        .unwrap_or(Pool::default().as_str())
        .parse()?;
    concurrency::maybe_patch_concurrency(pool);

    let hostname = options
        .get("hostname")
        .and_then(OptionValue::as_str)
        .map_or_else(|| nodenames::hostname_option(None), str::to_string);

    if options.get("detach").is_some_and(OptionValue::is_true) {
        let mut daemon_opts = options.extract(DETACH_EXCLUDED);
        let logfile = take_string(&mut daemon_opts, "logfile");
        let pidfile = take_string(&mut daemon_opts, "pidfile");

        let mut argv = ctx.forwarded_globals();
        argv.push("worker".to_string());
        argv.extend(reconstitute(&options));
        argv.extend(dynamic.overrides);

        return Ok(Launch::Detach(DetachRequest {
            path: ctx.executable.clone(),
            argv,
            logfile: logfile.map(|t| PathBuf::from(nodenames::node_format(&t, &hostname))),
            pidfile: pidfile.map(|t| PathBuf::from(nodenames::node_format(&t, &hostname))),
            uid: take_string(&mut daemon_opts, "uid"),
            gid: take_string(&mut daemon_opts, "gid"),
            umask: daemon_opts
                .remove("umask")
                .and_then(|v| v.as_int())
                .and_then(|v| u32::try_from(v).ok()),
            workdir: ctx.workdir.clone(),
            executable: take_string(&mut daemon_opts, "executable").map(PathBuf::from),
            hostname,
            fake: ctx.fake_fork,
        }));
    }

    let node_path = |name: &str| {
        options
            .get(name)
            .and_then(OptionValue::as_str)
            .map(|t| PathBuf::from(nodenames::node_format(t, &hostname)))
    };
    let logfile = node_path("logfile");
    let pidfile = node_path("pidfile");
    let statedb = node_path("statedb");
    let uid = options.get("uid").and_then(OptionValue::as_str).map(str::to_string);
    let gid = options.get("gid").and_then(OptionValue::as_str).map(str::to_string);
    let loglevel = match options.get("loglevel") {
        Some(OptionValue::Level(level)) => *level,
        _ => LogLevel::default(),
    };

    Ok(Launch::Inline {
        settings: WorkerSettings {
            hostname,
            pool,
            loglevel,
            logfile,
            pidfile,
            statedb,
            no_color: ctx.no_color,
            options,
            config,
        },
        uid,
        gid,
    })
}

fn run_inline(
    settings: WorkerSettings,
    uid: Option<String>,
    gid: Option<String>,
    app: &dyn WorkerApp,
    ctx: &LaunchContext,
) -> Result<i32, LaunchError> {
    if let Some(dir) = &ctx.workdir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("Failed to change directory to {}", dir.display()))
            .map_err(LaunchError::Worker)?;
    }
    daemon::maybe_drop_privileges(uid.as_deref(), gid.as_deref())?;

    let _guard = logging::init_worker_logging(
        settings.loglevel,
        settings.logfile.as_deref(),
        settings.no_color,
    )
    .map_err(LaunchError::Logging)?;

    tracing::info!(
        component = "launch",
        hostname = %settings.hostname,
        pool = %settings.pool,
        "Starting worker"
    );

    let mut worker = app.create_worker(settings).map_err(LaunchError::Worker)?;
    let code = worker.start().map_err(LaunchError::Worker)?;
    tracing::info!(component = "launch", code, "Worker exited");
    Ok(code)
}

/// Fills unset options from the app config.
fn apply_config_fallbacks(specs: &[OptionSpec], options: &mut ParsedOptions, config: &AppConfig) {
    for spec in specs {
        let Some(key) = spec.config_key else {
            continue;
        };
        if options.get(spec.name).is_some_and(|v| !v.is_none()) {
            continue;
        }
        if let Some(value) = config.lookup(key) {
            options.insert(spec.name, value);
        }
    }
}

fn take_string(options: &mut ParsedOptions, name: &str) -> Option<String> {
    options.remove(name).and_then(OptionValue::into_string)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EX_FAILURE, EX_USAGE};
    use crate::options::{OptionError, OptionKind};
    use crate::worker::Worker;
    use clap::Parser;

    fn ctx(dir: &Path) -> LaunchContext {
        LaunchContext {
            platform: Platform::Unix,
            executable: dir.join("missing-workerctl"),
            config_path: None,
            workdir: None,
            no_color: false,
            fake_fork: true,
        }
    }

    fn worker_args(tokens: &[&str]) -> WorkerArgs {
        let argv = ["workerctl", "worker"].iter().chain(tokens);
        match Cli::try_parse_from(argv).unwrap().command {
            super::super::Command::Worker(args) => args,
        }
    }

    struct ExitApp {
        code: i32,
    }

    struct ExitWorker {
        code: i32,
    }

    impl Worker for ExitWorker {
        fn start(&mut self) -> anyhow::Result<i32> {
            Ok(self.code)
        }
    }

    static APP_OPTIONS: &[OptionSpec] = &[
        OptionSpec::new("replicas", OptionKind::Int),
        OptionSpec::new("concurrency", OptionKind::Int),
        OptionSpec::new("canary", OptionKind::RestrictedFlag),
    ];

    impl WorkerApp for ExitApp {
        fn user_options(&self) -> &[OptionSpec] {
            APP_OPTIONS
        }

        fn create_worker(&self, _settings: WorkerSettings) -> anyhow::Result<Box<dyn Worker>> {
            Ok(Box::new(ExitWorker { code: self.code }))
        }
    }

    fn pair_follows(argv: &[String], flag: &str, value: &str) -> bool {
        argv.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_detach_request_from_options() {
        let dir = tempfile::tempdir().unwrap();
        let args = worker_args(&["--autoscale=10,0", "--pool=solo", "-D"]);

        let launch = prepare(args, AppConfig::default(), &ExitApp { code: 0 }, &ctx(dir.path())).unwrap();
        let Launch::Detach(request) = launch else {
            panic!("expected a detach");
        };

        assert_eq!(request.argv[0], "worker");
        assert!(pair_follows(&request.argv, "--autoscale", "10,0"));
        assert!(pair_follows(&request.argv, "--pool", "solo"));
        for excluded in DETACH_EXCLUDED {
            assert!(!request.argv.contains(&format!("--{excluded}")));
        }
        assert!(request.hostname.starts_with("worker@"));
        assert!(request.fake);

        // fake fork with an executable that does not exist
        assert_eq!(daemon::detach(&request).unwrap(), EX_FAILURE);
    }

    #[test]
    fn test_detach_passes_daemon_options_directly() {
        let dir = tempfile::tempdir().unwrap();
        let args = worker_args(&[
            "-D",
            "-n",
            "w1@box.example.com",
            "--logfile",
            "/var/log/%n.log",
            "--pidfile",
            "/run/%p.pid",
            "--umask",
            "027",
            "--uid",
            "nobody",
            "--executable",
            "/opt/bin/workerctl",
        ]);
        let mut context = ctx(dir.path());
        context.config_path = Some(PathBuf::from("/etc/worker.toml"));

        let Launch::Detach(request) = prepare(args, AppConfig::default(), &ExitApp { code: 0 }, &context).unwrap() else {
            panic!("expected a detach");
        };
        assert_eq!(&request.argv[..3], ["--config", "/etc/worker.toml", "worker"]);
        assert_eq!(request.logfile, Some(PathBuf::from("/var/log/w1.log")));
        assert_eq!(request.pidfile, Some(PathBuf::from("/run/w1@box.example.com.pid")));
        assert_eq!(request.umask, Some(0o027));
        assert_eq!(request.uid.as_deref(), Some("nobody"));
        assert_eq!(request.target(), Path::new("/opt/bin/workerctl"));
        assert_eq!(request.hostname, "w1@box.example.com");
    }

    #[test]
    fn test_beat_rejected_on_windows_before_detach() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = ctx(dir.path());
        context.platform = Platform::Windows;

        let err = prepare(worker_args(&["-B", "-D"]), AppConfig::default(), &ExitApp { code: 0 }, &context)
            .unwrap_err();
        assert!(matches!(
            err,
            LaunchError::Option(OptionError::UnsupportedOnPlatform { option: "beat", .. })
        ));
        assert_eq!(err.exit_code(), EX_USAGE);

        let err = prepare(
            worker_args(&["--canary"]),
            AppConfig::default(),
            &ExitApp { code: 0 },
            &context,
        )
        .unwrap_err();
        assert!(matches!(err, LaunchError::Option(_)));
    }

    #[test]
    fn test_dynamic_options_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let args = worker_args(&["--replicas", "3", "-c", "4", "prefetch_multiplier=16"]);

        let Launch::Inline { settings, .. } =
            prepare(args, AppConfig::default(), &ExitApp { code: 0 }, &ctx(dir.path())).unwrap()
        else {
            panic!("expected an inline run");
        };
        assert_eq!(settings.options.get("replicas"), Some(&OptionValue::Int(3)));
        assert_eq!(settings.options.get("concurrency"), Some(&OptionValue::Int(4)));
        assert_eq!(settings.config.worker.prefetch_multiplier, 16);
        assert_eq!(
            settings.options.get("prefetch-multiplier"),
            Some(&OptionValue::Int(16))
        );
    }

    #[test]
    fn test_same_named_option_reaches_the_worker_option() {
        let dir = tempfile::tempdir().unwrap();
        let args = worker_args(&["-c", "2", "--replicas", "3", "--concurrency", "9"]);

        let Launch::Inline { settings, .. } =
            prepare(args, AppConfig::default(), &ExitApp { code: 0 }, &ctx(dir.path())).unwrap()
        else {
            panic!("expected an inline run");
        };
        assert_eq!(settings.options.get("concurrency"), Some(&OptionValue::Int(9)));
        assert_eq!(settings.options.get("replicas"), Some(&OptionValue::Int(3)));
    }

    #[test]
    fn test_dynamic_options_survive_detach() {
        let dir = tempfile::tempdir().unwrap();
        let args = worker_args(&["-D", "--replicas", "3", "pool=solo"]);

        let Launch::Detach(request) =
            prepare(args, AppConfig::default(), &ExitApp { code: 0 }, &ctx(dir.path())).unwrap()
        else {
            panic!("expected a detach");
        };
        assert!(pair_follows(&request.argv, "--replicas", "3"));
        assert!(pair_follows(&request.argv, "--pool", "solo"));
        assert_eq!(request.argv.last().map(String::as_str), Some("pool=solo"));
    }

    #[test]
    fn test_unknown_option_and_bad_override_are_usage_errors() {
        let dir = tempfile::tempdir().unwrap();
        let app = ExitApp { code: 0 };

        let err = prepare(worker_args(&["--bogus"]), AppConfig::default(), &app, &ctx(dir.path()))
            .unwrap_err();
        assert!(matches!(err, LaunchError::UnrecognizedOption { ref option } if option == "--bogus"));

        let err = prepare(worker_args(&["broker=amqp://"]), AppConfig::default(), &app, &ctx(dir.path()))
            .unwrap_err();
        assert!(matches!(err, LaunchError::ConfigOverride(_)));
        assert!(err.to_string().starts_with("Unable to parse extra configuration from command line"));
    }

    #[test]
    fn test_config_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.worker.concurrency = 7;
        config.worker.state_db = Some("/var/lib/%n.db".into());

        let Launch::Inline { settings, .. } = prepare(
            worker_args(&["-n", "w2@host"]),
            config,
            &ExitApp { code: 0 },
            &ctx(dir.path()),
        )
        .unwrap() else {
            panic!("expected an inline run");
        };
        assert_eq!(settings.options.get("concurrency"), Some(&OptionValue::Int(7)));
        assert_eq!(settings.pool, Pool::Prefork);
        assert_eq!(settings.statedb, Some(PathBuf::from("/var/lib/w2.db")));
        assert_eq!(
            settings.options.get("schedule-filename"),
            Some(&OptionValue::Str("beat-schedule".into()))
        );
    }

    #[test]
    fn test_inline_run_returns_worker_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let app = ExitApp { code: 3 };
        let code = worker(worker_args(&["-P", "solo", "-l", "error"]), &app, &ctx(dir.path())).unwrap();
        assert_eq!(code, 3);
    }
}
