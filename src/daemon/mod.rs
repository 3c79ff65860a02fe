//! Detaching the worker: fork into the background, then exec the worker
//! sub-command with the rebuilt argument vector.
//!
//! ```text
//! RunningInParent --exec ok-----> ExecReplaced  (never returns)
//!                 \--exec error--> ExecFailed    (logged, EX_FAILURE)
//! ```

pub mod privileges;

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ExecFailure, LaunchError, EX_FAILURE};
use crate::logging;

pub use privileges::maybe_drop_privileges;

/// When set (non-empty), detach without forking; used by test harnesses.
pub const FAKEFORK_ENV: &str = "WORKER_FAKEFORK";

pub fn fake_fork_requested() -> bool {
    std::env::var_os(FAKEFORK_ENV).is_some_and(|v| !v.is_empty())
}

/// Everything needed to start the detached worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DetachRequest {
    /// This program.
    pub path: PathBuf,
    /// Arguments after the program name.
    pub argv: Vec<String>,
    pub logfile: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub umask: Option<u32>,
    pub workdir: Option<PathBuf>,
    /// Replaces `path` as the program to exec.
    pub executable: Option<PathBuf>,
    /// Only used to label log messages.
    pub hostname: String,
    pub fake: bool,
}

impl DetachRequest {
    pub fn target(&self) -> &Path {
        self.executable.as_deref().unwrap_or(&self.path)
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.target().display().to_string())
            .chain(self.argv.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Detaches and execs the worker described by `request`.
///
/// Returns only if the exec failed (`EX_FAILURE`, after logging why) or, on
/// platforms without exec, with the child's exit code. Errors while acquiring
/// the daemon resources are returned as they are.
pub fn detach(request: &DetachRequest) -> Result<i32, LaunchError> {
    let fake = request.fake || fake_fork_requested();
    let _scope = DetachScope::open(request, fake)?;

    match exec_replace(request.target(), &request.argv) {
        Ok(code) => Ok(code),
        Err(failure) => Ok(report_exec_failure(request, &failure)),
    }
}

fn report_exec_failure(request: &DetachRequest, failure: &ExecFailure) -> i32 {
    let (dispatch, _guard) = logging::failure_dispatch(request.logfile.as_deref());
    tracing::dispatcher::with_default(&dispatch, || {
        let _span = tracing::error_span!("detach", hostname = %request.hostname).entered();
        tracing::error!(
            severity = "CRITICAL",
            error = %failure,
            cause = %failure.source_error(),
            "Can't exec {:?}",
            request.command_line()
        );
    });
    EX_FAILURE
}

#[cfg(unix)]
fn exec_replace(target: &Path, argv: &[String]) -> Result<i32, ExecFailure> {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new(target).args(argv).exec();
    // exec() only returns on error
    Err(ExecFailure::from_io(target.to_path_buf(), err))
}

/// Without exec the best we can do is run the worker as a child and mirror
/// its exit code.
#[cfg(not(unix))]
fn exec_replace(target: &Path, argv: &[String]) -> Result<i32, ExecFailure> {
    let status = std::process::Command::new(target)
        .args(argv)
        .status()
        .map_err(|e| ExecFailure::from_io(target.to_path_buf(), e))?;
    Ok(status.code().unwrap_or(EX_FAILURE))
}

/// Daemon resources held between fork and exec. Dropping the scope (any
/// failure before the exec succeeds) removes the pid file it wrote.
struct DetachScope {
    pidfile: Option<Pidfile>,
    owns_pidfile: bool,
}

impl DetachScope {
    fn open(request: &DetachRequest, fake: bool) -> Result<Self, LaunchError> {
        maybe_drop_privileges(request.uid.as_deref(), request.gid.as_deref())?;

        let workdir = match &request.workdir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()
                .context("Failed to read current directory")
                .map_err(LaunchError::Detach)?,
        };

        let pidfile = request.pidfile.as_deref().map(Pidfile::new);
        if let Some(pidfile) = &pidfile {
            if pidfile.is_running().map_err(LaunchError::Detach)? {
                return Err(LaunchError::AlreadyRunning {
                    path: pidfile.path().to_path_buf(),
                    pid: pidfile.read_pid().map_err(LaunchError::Detach)?,
                });
            }
        }

        let mut scope = DetachScope {
            pidfile,
            owns_pidfile: false,
        };

        if fake {
            scope.enter_fake(&workdir, request.umask)?;
        } else {
            scope.enter_daemon(request, &workdir)?;
        }

        if let Some(logfile) = &request.logfile {
            logging::open_append(logfile).map_err(LaunchError::Detach)?;
        }

        tracing::debug!(component = "launch", fake, workdir = %workdir.display(), "Detached");
        Ok(scope)
    }

    /// Same steps as a real detach, minus the fork and stdio redirection.
    fn enter_fake(&mut self, workdir: &Path, umask: Option<u32>) -> Result<(), LaunchError> {
        std::env::set_current_dir(workdir)
            .with_context(|| format!("Failed to change directory to {}", workdir.display()))
            .map_err(LaunchError::Detach)?;
        if let Some(mask) = umask {
            set_umask(mask);
        }
        if let Some(pidfile) = &self.pidfile {
            pidfile
                .write_pid(std::process::id())
                .map_err(LaunchError::Detach)?;
            self.owns_pidfile = true;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn enter_daemon(&mut self, request: &DetachRequest, workdir: &Path) -> Result<(), LaunchError> {
        use daemonize::Daemonize;

        let mut daemonize = Daemonize::new()
            .working_directory(workdir)
            .umask(request.umask.map_or_else(current_umask, |m| m as nix::libc::mode_t));

        if let Some(pidfile) = &request.pidfile {
            if let Some(parent) = pidfile.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))
                    .map_err(LaunchError::Detach)?;
            }
            daemonize = daemonize.pid_file(pidfile);
        }

        if let Some(logfile) = &request.logfile {
            let stdout = logging::open_append(logfile).map_err(LaunchError::Detach)?;
            let stderr = stdout
                .try_clone()
                .context("Failed to duplicate log file handle")
                .map_err(LaunchError::Detach)?;
            daemonize = daemonize.stdout(stdout).stderr(stderr);
        }

        // The parent exits inside start(); only the daemon gets past here.
        daemonize
            .start()
            .map_err(|e| LaunchError::Detach(anyhow!("{e}")))?;
        self.owns_pidfile = self.pidfile.is_some();
        Ok(())
    }

    #[cfg(not(unix))]
    fn enter_daemon(&mut self, request: &DetachRequest, workdir: &Path) -> Result<(), LaunchError> {
        tracing::warn!(component = "launch", "Cannot fork on this platform, running detached worker as a child");
        self.enter_fake(workdir, request.umask)
    }
}

impl Drop for DetachScope {
    fn drop(&mut self) {
        if !self.owns_pidfile {
            return;
        }
        if let Some(pidfile) = &self.pidfile {
            if let Err(e) = pidfile.remove() {
                tracing::warn!(component = "launch", error = %e, "Failed to remove pid file");
            }
        }
    }
}

#[cfg(unix)]
fn current_umask() -> nix::libc::mode_t {
    use nix::sys::stat::{umask, Mode};

    let old = umask(Mode::empty());
    umask(old);
    old.bits()
}

#[cfg(unix)]
fn set_umask(mask: u32) {
    use nix::sys::stat::{umask, Mode};

    umask(Mode::from_bits_truncate(mask as nix::libc::mode_t));
}

#[cfg(not(unix))]
fn set_umask(_mask: u32) {}

/// Pid file of a running worker.
#[derive(Debug, Clone)]
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_pid(&self) -> Result<i32> {
        let content = fs::read_to_string(&self.path).context("Failed to read PID file")?;
        content
            .trim()
            .parse()
            .context("Invalid PID in PID file")
    }

    /// Whether the pid file names a live process. Stale and unreadable pid
    /// files are removed.
    pub fn is_running(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }

        let pid = match self.read_pid() {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!(component = "launch", path = %self.path.display(), error = %e, "Removing broken pid file");
                self.remove()?;
                return Ok(false);
            }
        };

        #[cfg(unix)]
        {
            use nix::sys::signal;
            use nix::unistd::Pid;
            match signal::kill(Pid::from_raw(pid), None) {
                Ok(_) => Ok(true),
                Err(nix::errno::Errno::ESRCH) => {
                    // stale
                    self.remove()?;
                    Ok(false)
                }
                Err(nix::errno::Errno::EPERM) => Ok(true),
                Err(e) => Err(e).context("Failed to check process status"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            // taken at face value without kill(2)
            Ok(true)
        }
    }

    pub fn write_pid(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{pid}\n"))
            .with_context(|| format!("Failed to write PID file {}", self.path.display()))?;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
