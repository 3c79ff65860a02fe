pub mod args;
pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::concurrency;
use crate::error::{LaunchError, EX_OK, EX_USAGE};
use crate::worker::WorkerApp;

pub use args::{WorkerArgs, WORKER_OPTIONS};
pub use commands::LaunchContext;

#[derive(Parser, Debug)]
#[command(name = "workerctl", version, about = "Start a worker in the foreground or as a background daemon")]
pub struct Cli {
    /// App config file (TOML); defaults to ~/.worker/config.toml
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory to change to before starting the worker
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Disable colors in log output
    #[arg(long)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start worker instance
    ///
    /// Options this command does not know are handed to the worker
    /// application, and bare key=value arguments override settings from
    /// the config file.
    Worker(WorkerArgs),
}

/// Parses `argv` (program name first) and runs it, returning the exit code.
pub fn launch(argv: Vec<String>, app: &dyn WorkerApp) -> i32 {
    // must happen before anything else resolves options or touches I/O
    concurrency::patch_from_argv(&argv);

    let cli = match Cli::try_parse_from(&argv) {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { EX_USAGE } else { EX_OK };
            let _ = err.print();
            return code;
        }
    };

    let argv0 = argv.first().map(String::as_str).unwrap_or("workerctl");
    let ctx = LaunchContext::from_cli(&cli, argv0);
    match run(cli, app, &ctx) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            err.exit_code()
        }
    }
}

pub fn run(cli: Cli, app: &dyn WorkerApp, ctx: &LaunchContext) -> Result<i32, LaunchError> {
    match cli.command {
        Command::Worker(args) => commands::worker(args, app, ctx),
    }
}
