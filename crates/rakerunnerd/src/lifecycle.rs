//! Daemon lifecycle: detaching, PID-file exclusivity, signal handling and
//! the operator-side stop/status helpers.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult, Pid};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;

use crate::channel::CommandChannel;
use crate::daemon_log::DaemonLog;

pub const DEFAULT_DAEMON_NAME: &str = "rakerunner";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Foreground,
    Detaching,
    Running,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("pid file {path} exists; not starting")]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },
    #[error("failed to access pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pid file {path} does not contain a pid: {contents:?}")]
    InvalidPid { path: PathBuf, contents: String },
    #[error("failed to detach ({step}): {source}")]
    Detach {
        step: &'static str,
        #[source]
        source: Errno,
    },
    #[error("failed to redirect stdio to /dev/null: {source}")]
    DevNull {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to install signal handlers: {source}")]
    Signals {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to signal daemon on pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: Errno,
    },
    #[error(transparent)]
    Service(anyhow::Error),
}

/// Check if a lifecycle transition is valid.
///
/// ```text
/// Foreground → Detaching → Running → Stopped
///      └──────────────────────↗
/// ```
/// A start that fails part way may go straight to Stopped.
pub fn is_transition_allowed(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState::*;

    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Foreground, Detaching)
            | (Foreground, Running)
            | (Detaching, Running)
            | (Foreground, Stopped)
            | (Detaching, Stopped)
            | (Running, Stopped)
    )
}

/// What the lifecycle drives once the process is set up.
pub trait DaemonService: Send + Sync + 'static {
    /// Blocks until the service has stopped.
    fn run(&self) -> anyhow::Result<()>;
    /// Ordered stop. Must be safe to call more than once and from any thread.
    fn shutdown(&self);
}

/// `<dir>/<name>.pid`, `.log` and `.fifo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub dir: PathBuf,
    pub name: String,
}

impl DaemonPaths {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join(format!("{}.pid", self.name))
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.name))
    }

    pub fn fifo_file(&self) -> PathBuf {
        self.dir.join(format!("{}.fifo", self.name))
    }

    /// Remove the pid file and FIFO. The log stays.
    pub fn cleanup(&self, log: &DaemonLog) {
        let pid_file = self.pid_file();
        match fs::remove_file(&pid_file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => log.error(&format!("failed to remove {}: {err}", pid_file.display())),
        }
        if let Err(err) = CommandChannel::new(self.fifo_file()).remove() {
            log.error(&err.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically create the file holding `pid`; fails if it already exists.
    pub fn create(&self, pid: u32) -> Result<(), LifecycleError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(LifecycleError::AlreadyRunning {
                    path: self.path.clone(),
                    pid: self.read().ok().flatten(),
                })
            }
            Err(source) => {
                return Err(LifecycleError::PidFile {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        writeln!(file, "{pid}").map_err(|source| LifecycleError::PidFile {
            path: self.path.clone(),
            source,
        })
    }

    pub fn read(&self) -> Result<Option<u32>, LifecycleError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LifecycleError::PidFile {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        contents
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| LifecycleError::InvalidPid {
                path: self.path.clone(),
                contents,
            })
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// Fork into the background. Off for `--foreground`.
    pub detach: bool,
    /// Keep stderr open after detaching.
    pub debug: bool,
    pub handle_signals: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            detach: true,
            debug: false,
            handle_signals: true,
        }
    }
}

pub struct DaemonLifecycle {
    paths: DaemonPaths,
    state: LifecycleState,
}

impl DaemonLifecycle {
    pub fn new(paths: DaemonPaths) -> Self {
        Self {
            paths,
            state: LifecycleState::Foreground,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    fn transition(&mut self, to: LifecycleState) -> Result<(), LifecycleError> {
        if !is_transition_allowed(self.state, to) {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Detach if asked, claim the pid file, then run `service` until it
    /// stops. Returns in the daemon process only.
    pub fn start(
        &mut self,
        service: Arc<dyn DaemonService>,
        options: StartOptions,
        log: &DaemonLog,
    ) -> Result<(), LifecycleError> {
        let pid_file = PidFile::new(self.paths.pid_file());
        // Checked again atomically below; this one lets the CLI report it
        // before stderr goes away.
        if pid_file.exists() {
            self.transition(LifecycleState::Stopped)?;
            return Err(LifecycleError::AlreadyRunning {
                path: pid_file.path().to_path_buf(),
                pid: pid_file.read().ok().flatten(),
            });
        }

        if options.detach {
            self.transition(LifecycleState::Detaching)?;
            if let Err(err) = detach(options.debug) {
                self.transition(LifecycleState::Stopped)?;
                return Err(err);
            }
        }

        if let Err(err) = pid_file.create(process::id()) {
            log.error(&err.to_string());
            self.transition(LifecycleState::Stopped)?;
            return Err(err);
        }
        self.transition(LifecycleState::Running)?;
        log.info(&format!("starting daemon on pid {}", process::id()));

        if options.handle_signals {
            if let Err(err) =
                install_signal_handler(Arc::clone(&service), self.paths.clone(), log.clone())
            {
                self.paths.cleanup(log);
                self.transition(LifecycleState::Stopped)?;
                return Err(err);
            }
        }

        let result = service.run();
        service.shutdown();
        self.paths.cleanup(log);
        self.transition(LifecycleState::Stopped)?;
        log.info("daemon stopped");
        result.map_err(LifecycleError::Service)
    }
}

/// Fork, start a new session, fork again so the daemon can never reacquire
/// a terminal, then drop the working directory, umask and stdio. Both
/// intermediate parents exit here.
pub fn detach(debug: bool) -> Result<(), LifecycleError> {
    fork_and_exit_parent("first fork")?;
    setsid().map_err(|source| LifecycleError::Detach {
        step: "setsid",
        source,
    })?;
    fork_and_exit_parent("second fork")?;
    chdir("/").map_err(|source| LifecycleError::Detach {
        step: "chdir",
        source,
    })?;
    umask(Mode::empty());
    redirect_stdio(debug)
}

fn fork_and_exit_parent(step: &'static str) -> Result<(), LifecycleError> {
    // SAFETY: called before the daemon spawns any threads, so the child
    // inherits no lock held by another thread.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => process::exit(0),
        Ok(ForkResult::Child) => Ok(()),
        Err(source) => Err(LifecycleError::Detach { step, source }),
    }
}

fn redirect_stdio(debug: bool) -> Result<(), LifecycleError> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|source| LifecycleError::DevNull { source })?;
    let mut targets = vec![0, 1];
    if !debug {
        targets.push(2);
    }
    for target in targets {
        dup2(null.as_raw_fd(), target).map_err(|source| LifecycleError::Detach {
            step: "dup2",
            source,
        })?;
    }
    Ok(())
}

/// SIGTERM or SIGINT: stop the service, remove pid file and FIFO, exit 0.
pub fn install_signal_handler(
    service: Arc<dyn DaemonService>,
    paths: DaemonPaths,
    log: DaemonLog,
) -> Result<thread::JoinHandle<()>, LifecycleError> {
    let mut signals =
        Signals::new([SIGTERM, SIGINT]).map_err(|source| LifecycleError::Signals { source })?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                log.info(&format!("caught signal {signal}; stopping daemon"));
                service.shutdown();
                paths.cleanup(&log);
                log.info("daemon stopped");
                process::exit(0);
            }
        })
        .map_err(|source| LifecycleError::Signals { source })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running(u32),
    /// The pid file names a process that no longer exists.
    Stale(u32),
    NotRunning,
}

pub fn daemon_status(paths: &DaemonPaths) -> Result<DaemonStatus, LifecycleError> {
    let Some(pid) = PidFile::new(paths.pid_file()).read()? else {
        return Ok(DaemonStatus::NotRunning);
    };
    if rake_proc::is_alive(pid) {
        Ok(DaemonStatus::Running(pid))
    } else {
        Ok(DaemonStatus::Stale(pid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No pid file.
    NotRunning,
    Signalled(u32),
    /// The pid file named a process that is gone.
    NoProcess(u32),
}

/// Send SIGTERM to the pid in the pid file. The daemon's own handler does
/// the rest.
pub fn stop_daemon(paths: &DaemonPaths) -> Result<StopOutcome, LifecycleError> {
    let Some(pid) = PidFile::new(paths.pid_file()).read()? else {
        return Ok(StopOutcome::NotRunning);
    };
    let Ok(raw) = i32::try_from(pid) else {
        return Ok(StopOutcome::NoProcess(pid));
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => Ok(StopOutcome::Signalled(pid)),
        Err(Errno::ESRCH) => Ok(StopOutcome::NoProcess(pid)),
        Err(source) => Err(LifecycleError::Signal { pid, source }),
    }
}
