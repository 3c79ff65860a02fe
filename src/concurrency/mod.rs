//! Pool selection and the process-wide I/O runtime that goes with it.
//!
//! The cooperative pools (`tokio`, `tokio-local`) need every piece of I/O in
//! the process to go through one runtime, so the runtime flavour has to be
//! fixed before anything else resolves options or opens sockets. The launcher
//! calls [`patch_from_argv`] first thing; the first patch wins and later calls
//! are no-ops. The runtime itself is only built on first use by the worker
//! ([`io_runtime`]), which keeps the process single-threaded until after any
//! fork.

mod block;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use crate::options::OptionError;

use block::BlockDetector;

/// Block-detection threshold for the `tokio-local` pool, in seconds.
pub const NOBLOCK_ENV: &str = "WORKER_NOBLOCK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pool {
    #[default]
    Prefork,
    Tokio,
    TokioLocal,
    Solo,
}

impl Pool {
    pub const NAMES: &'static [&'static str] = &["prefork", "tokio", "tokio-local", "solo"];

    pub fn as_str(self) -> &'static str {
        match self {
            Pool::Prefork => "prefork",
            Pool::Tokio => "tokio",
            Pool::TokioLocal => "tokio-local",
            Pool::Solo => "solo",
        }
    }

    pub fn is_cooperative(self) -> bool {
        matches!(self, Pool::Tokio | Pool::TokioLocal)
    }
}

impl FromStr for Pool {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefork" => Ok(Pool::Prefork),
            "tokio" => Ok(Pool::Tokio),
            "tokio-local" => Ok(Pool::TokioLocal),
            "solo" => Ok(Pool::Solo),
            other => Err(OptionError::InvalidChoice {
                value: other.to_string(),
                choices: Self::NAMES.to_vec(),
            }),
        }
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The process-wide I/O setup installed for a cooperative pool.
#[derive(Debug, Clone, PartialEq)]
pub struct IoPatch {
    pub pool: Pool,
    pub block_detection: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PatchOutcome {
    Applied(&'static IoPatch),
    AlreadyApplied(&'static IoPatch),
    NotRequired,
}

static IO_PATCH: OnceLock<IoPatch> = OnceLock::new();
static IO_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Installs the I/O setup for `pool` if it is a cooperative pool.
pub fn maybe_patch_concurrency(pool: Pool) -> PatchOutcome {
    if !pool.is_cooperative() {
        return PatchOutcome::NotRequired;
    }

    let mut applied = false;
    let patch = IO_PATCH.get_or_init(|| {
        applied = true;
        let block_detection = match pool {
            Pool::TokioLocal => parse_block_threshold(std::env::var(NOBLOCK_ENV).ok().as_deref()),
            _ => None,
        };
        IoPatch {
            pool,
            block_detection,
        }
    });

    if applied {
        tracing::debug!(component = "concurrency", pool = %patch.pool, block_detection = ?patch.block_detection, "I/O runtime patched");
        PatchOutcome::Applied(patch)
    } else {
        PatchOutcome::AlreadyApplied(patch)
    }
}

/// The patch installed by the first cooperative [`maybe_patch_concurrency`] call.
pub fn active_patch() -> Option<&'static IoPatch> {
    IO_PATCH.get()
}

/// Looks for `-P`/`--pool` in raw argv and patches for it. Runs before clap
/// sees the arguments; an invalid pool name is left for clap to report.
pub fn patch_from_argv(argv: &[String]) -> PatchOutcome {
    pool_from_argv(argv).map_or(PatchOutcome::NotRequired, maybe_patch_concurrency)
}

pub fn pool_from_argv(argv: &[String]) -> Option<Pool> {
    let mut tokens = argv.iter().skip(1);
    while let Some(token) = tokens.next() {
        let value = match token.as_str() {
            "--" => return None,
            "-P" | "--pool" => tokens.next().map(String::as_str),
            t => t
                .strip_prefix("--pool=")
                .or_else(|| t.strip_prefix("-P").filter(|rest| !rest.is_empty())),
        };
        if let Some(pool) = value.and_then(|v| v.trim_start_matches('=').parse().ok()) {
            return Some(pool);
        }
    }
    None
}

/// Parses the block-detection threshold; unset, zero, out of range or garbage
/// disables it.
pub fn parse_block_threshold(raw: Option<&str>) -> Option<Duration> {
    let seconds: f64 = raw?.trim().parse().ok()?;
    if seconds <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

/// The I/O runtime matching the active patch, built on first use.
///
/// `tokio` gets a multi-threaded runtime; everything else runs I/O on a
/// current-thread runtime, with block detection when it was requested.
pub fn io_runtime() -> io::Result<&'static Runtime> {
    if let Some(runtime) = IO_RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = build_runtime(active_patch())?;
    Ok(IO_RUNTIME.get_or_init(|| runtime))
}

fn build_runtime(patch: Option<&IoPatch>) -> io::Result<Runtime> {
    if patch.map(|p| p.pool) == Some(Pool::Tokio) {
        return Builder::new_multi_thread()
            .enable_all()
            .thread_name("worker-io")
            .build();
    }

    let mut builder = Builder::new_current_thread();
    builder.enable_all();
    if let Some(threshold) = patch.and_then(|p| p.block_detection) {
        let detector = BlockDetector::spawn(threshold)?;
        let on_park = detector.clone();
        builder
            .on_thread_park(move || on_park.parked())
            .on_thread_unpark(move || detector.unparked());
    }
    builder.build()
}
