//! The rakerunner daemon service: wires state, the command observer and the
//! reconcile loop together and owns the shutdown handshake.

use anyhow::{anyhow, Context};
use rake_core::{expand_config_path, CommandMessage, ConfigError, ResolvedConfig, StartupPaths};
use rake_proc::{resolve_program, InvocationTemplate, ProcError};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::channel::{ChannelError, CommandChannel};
use crate::daemon_log::DaemonLog;
use crate::daemon_loop::{ConfigSource, FileConfigSource, ReconcileLoop, IDLE_SLEEP};
use crate::lifecycle::{DaemonPaths, DaemonService};
use crate::observer::{CommandObserver, ObserverHandle, COMMAND_CHECK_WAIT, RECEIVE_TIMEOUT};
use crate::runtime::TaskRuntime;
use crate::state::{SharedState, SupervisionState};

/// How often shutdown checks whether the observer has exited.
pub const STOP_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Proc(#[from] ProcError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Everything fixed at startup from the first configuration load.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSetup {
    pub conf_file: PathBuf,
    pub hostname: String,
    pub config: ResolvedConfig,
    pub startup: StartupPaths,
    pub paths: DaemonPaths,
    pub template: InvocationTemplate,
}

/// Load and check the configuration the daemon refuses to start without.
pub fn prepare(
    conf_file: impl Into<PathBuf>,
    hostname: &str,
    name: &str,
) -> Result<RunnerSetup, RunnerError> {
    let conf_file: PathBuf = conf_file.into();
    let conf_file = expand_config_path(&conf_file)?;
    let config = FileConfigSource::new(&conf_file, hostname).load()?;
    let startup = config.startup_paths()?;
    let interpreter = resolve_program(&config.interpreter)?;
    Ok(RunnerSetup {
        template: InvocationTemplate::new(interpreter, &startup.rake_file),
        paths: DaemonPaths::new(&startup.daemon_dir, name),
        conf_file,
        hostname: hostname.to_string(),
        config,
        startup,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerTiming {
    pub idle: Duration,
    pub observer_poll: Duration,
    pub receive_timeout: Duration,
    pub stop_poll: Duration,
}

impl Default for RunnerTiming {
    fn default() -> Self {
        Self {
            idle: IDLE_SLEEP,
            observer_poll: COMMAND_CHECK_WAIT,
            receive_timeout: RECEIVE_TIMEOUT,
            stop_poll: STOP_POLL,
        }
    }
}

pub struct RakeRunner {
    setup: RunnerSetup,
    state: SharedState,
    runtime: Arc<TaskRuntime>,
    log: DaemonLog,
    timing: RunnerTiming,
    source: Mutex<Option<Box<dyn ConfigSource>>>,
    observer: Mutex<Option<ObserverHandle>>,
    /// Held for the whole stop procedure; `true` once it has completed.
    stopped: Mutex<bool>,
}

impl RakeRunner {
    pub fn new(setup: RunnerSetup, runtime: Arc<TaskRuntime>, log: DaemonLog) -> Self {
        let source = FileConfigSource::new(&setup.conf_file, setup.hostname.clone());
        Self {
            state: SharedState::new(SupervisionState::new(setup.config.clone())),
            setup,
            runtime,
            log,
            timing: RunnerTiming::default(),
            source: Mutex::new(Some(Box::new(source))),
            observer: Mutex::new(None),
            stopped: Mutex::new(false),
        }
    }

    /// Real processes on this host.
    pub fn system(setup: RunnerSetup, log: DaemonLog) -> Self {
        let runtime = Arc::new(TaskRuntime::system(setup.template.clone()));
        Self::new(setup, runtime, log)
    }

    pub fn with_timing(mut self, timing: RunnerTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    fn log_startup(&self) {
        let setup = &self.setup;
        self.log.info(&format!("conf_file: {}", setup.conf_file.display()));
        self.log.info(&format!("daemon_name: {}", setup.paths.name));
        self.log
            .info(&format!("daemon_dir: {}", setup.startup.daemon_dir.display()));
        self.log
            .info(&format!("rake_file: {}", setup.startup.rake_file.display()));
        for spec in setup.config.tasks.values() {
            self.log.info(&format!("rake: {} qty: {}", spec.name, spec.qty));
        }
        for warning in &setup.config.warnings {
            self.log.warn(warning);
        }
    }

    fn start_observer(&self) -> anyhow::Result<()> {
        let channel = CommandChannel::new(self.setup.paths.fifo_file());
        channel.create()?;
        let handle = CommandObserver::new(
            channel,
            self.state.clone(),
            Arc::clone(&self.runtime),
            self.log.clone(),
        )
        .with_timing(self.timing.observer_poll, self.timing.receive_timeout)
        .spawn()
        .context("failed to spawn command observer")?;
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    fn stop_observer(&self) {
        let handle = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if handle.is_running() {
            self.log
                .info("sending 'shutdown' to command observer; waiting for it to stop");
            // The observer also exits on its own once shutdown has begun, so
            // nobody may be left to open the FIFO.
            let channel = CommandChannel::new(self.setup.paths.fifo_file())
                .with_send_deadline(self.timing.stop_poll);
            if let Err(err) = channel.send(&CommandMessage::Shutdown) {
                if handle.is_running() {
                    self.log.warn(&err.to_string());
                }
            }
            while handle.is_running() {
                thread::sleep(self.timing.stop_poll);
            }
        }
        if handle.join().is_err() {
            self.log.error("command observer panicked");
        }
    }
}

impl DaemonService for RakeRunner {
    fn run(&self) -> anyhow::Result<()> {
        self.log_startup();
        self.start_observer()?;
        let source = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("daemon service already ran"))?;
        ReconcileLoop::new(
            self.state.clone(),
            Arc::clone(&self.runtime),
            source,
            self.setup.startup.clone(),
            self.log.clone(),
        )
        .with_idle(self.timing.idle)
        .run();
        Ok(())
    }

    /// Block launches, stop the observer, then terminate every started task.
    fn shutdown(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        if *stopped {
            return;
        }
        self.log.info("stopping daemon");
        self.state.begin_shutdown();
        self.stop_observer();

        self.log.info("terminating all started rakes");
        let mut state = self.state.lock();
        for task in &state.started {
            if let Err(err) = self.runtime.stop_task(task, &self.log) {
                self.log.error(&format!("failed to stop {task}: {err}"));
            }
        }
        state.started.clear();
        *stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_world::FakeWorld;
    use std::fs;
    use std::path::Path;
    use std::time::Instant;

    fn write_config(dir: &Path, rakes: &str) -> PathBuf {
        fs::write(dir.join("Rakefile"), "").expect("rakefile");
        fs::create_dir_all(dir.join("run")).expect("daemon dir");
        let conf = dir.join("rakerunner.conf");
        fs::write(
            &conf,
            format!(
                "\"*\":\n  rake_file: Rakefile\n  daemon_dir: run\n  interpreter: /bin/sh\n  rakes:\n{rakes}"
            ),
        )
        .expect("config");
        conf
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn fast() -> RunnerTiming {
        RunnerTiming {
            idle: Duration::from_millis(20),
            observer_poll: Duration::from_millis(10),
            receive_timeout: Duration::from_millis(100),
            stop_poll: Duration::from_millis(20),
        }
    }

    #[test]
    fn prepare_resolves_paths_and_interpreter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = write_config(dir.path(), "    - rake: a\n");
        let setup = prepare(&conf, "web1", "rakerunner").expect("prepare");
        assert_eq!(setup.template.interpreter, PathBuf::from("/bin/sh"));
        assert_eq!(setup.template.task_file, dir.path().join("Rakefile"));
        assert_eq!(
            setup.paths.pid_file(),
            dir.path().join("run").join("rakerunner.pid")
        );
    }

    #[test]
    fn prepare_anchors_a_relative_config_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_config(dir.path(), "    - rake: a\n");
        // Reach the tempdir from the working directory through `..` segments.
        let cwd = std::env::current_dir().expect("cwd");
        let mut relative = PathBuf::new();
        for _ in cwd.components().skip(1) {
            relative.push("..");
        }
        let conf = relative
            .join(dir.path().strip_prefix("/").expect("absolute tempdir"))
            .join("rakerunner.conf");
        assert!(conf.is_relative());

        let setup = prepare(&conf, "web1", "rakerunner").expect("prepare");
        assert_eq!(setup.conf_file, dir.path().join("rakerunner.conf"));
        assert_eq!(setup.template.task_file, dir.path().join("Rakefile"));
        assert!(setup.paths.pid_file().is_absolute());
        assert_eq!(
            setup.paths.fifo_file(),
            dir.path().join("run").join("rakerunner.fifo")
        );
        assert!(FileConfigSource::new(&setup.conf_file, "web1").load().is_ok());
    }

    #[test]
    fn prepare_rejects_missing_rake_file_and_interpreter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = write_config(dir.path(), "    - rake: a\n");
        fs::remove_file(dir.path().join("Rakefile")).expect("remove");
        assert!(matches!(
            prepare(&conf, "web1", "rakerunner"),
            Err(RunnerError::Config(ConfigError::MissingPath { .. }))
        ));

        fs::write(dir.path().join("Rakefile"), "").expect("rakefile");
        let body = fs::read_to_string(&conf)
            .expect("read")
            .replace("/bin/sh", "/definitely/missing/rake");
        fs::write(&conf, body).expect("write");
        assert!(matches!(
            prepare(&conf, "web1", "rakerunner"),
            Err(RunnerError::Proc(ProcError::ProgramNotFound { .. }))
        ));
    }

    #[test]
    fn shutdown_stops_observer_before_terminating_tasks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = write_config(dir.path(), "    - rake: a\n      qty: 2\n");
        let setup = prepare(&conf, "web1", "rakerunner").expect("prepare");
        let log_path = setup.paths.log_file();
        let fifo = setup.paths.fifo_file();

        let world = FakeWorld::new();
        let runner = Arc::new(
            RakeRunner::new(
                setup,
                Arc::new(world.runtime()),
                DaemonLog::open(&log_path, false).expect("log"),
            )
            .with_timing(fast()),
        );

        let service = Arc::clone(&runner);
        let daemon = thread::spawn(move || service.run());
        assert!(wait_until(|| world.running("a") == 2));
        assert!(fifo.exists());

        runner.shutdown();
        daemon.join().expect("join").expect("run");
        assert_eq!(world.running("a"), 0);
        assert!(runner.state().snapshot().started.is_empty());
        assert!(runner.state().is_shutting_down());

        let launched = world.launched().len();
        runner.shutdown();
        assert_eq!(world.launched().len(), launched);

        let body = fs::read_to_string(&log_path).expect("read log");
        let position = |needle: &str| {
            body.find(needle)
                .unwrap_or_else(|| panic!("{needle:?} missing from log:\n{body}"))
        };
        assert!(position("stopping command observer") < position("terminating all started rakes"));
        assert!(position("stopping command observer") < position("stopping all instances of a"));
    }

    #[test]
    fn shutdown_does_not_wait_out_the_full_send_deadline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = write_config(dir.path(), "    - rake: a\n      qty: 1\n");
        let setup = prepare(&conf, "web1", "rakerunner").expect("prepare");
        let log_path = setup.paths.log_file();

        let world = FakeWorld::new();
        let runner = Arc::new(
            RakeRunner::new(
                setup,
                Arc::new(world.runtime()),
                DaemonLog::open(&log_path, false).expect("log"),
            )
            .with_timing(fast()),
        );
        let service = Arc::clone(&runner);
        let daemon = thread::spawn(move || service.run());
        assert!(wait_until(|| world.running("a") == 1));

        // Let the observer notice shutdown on its own before the handshake.
        runner.state().begin_shutdown();
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        runner.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));
        daemon.join().expect("join").expect("run");
        assert_eq!(world.running("a"), 0);

        let body = fs::read_to_string(&log_path).expect("read log");
        assert!(!body.contains("warning:"), "unexpected warning in:\n{body}");
    }

    #[test]
    fn operator_commands_reach_the_running_daemon() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = write_config(dir.path(), "    - rake: a\n      qty: 1\n");
        let setup = prepare(&conf, "web1", "rakerunner").expect("prepare");
        let sender = CommandChannel::new(setup.paths.fifo_file());

        let world = FakeWorld::new();
        let runner = Arc::new(
            RakeRunner::new(setup, Arc::new(world.runtime()), DaemonLog::disabled())
                .with_timing(fast()),
        );
        let service = Arc::clone(&runner);
        let daemon = thread::spawn(move || service.run());
        assert!(wait_until(|| world.running("a") == 1));

        sender
            .send(&CommandMessage::StopRake("a".to_string()))
            .expect("stoprake");
        assert!(wait_until(|| world.running("a") == 0));
        sender
            .send(&CommandMessage::StartRake("a".to_string()))
            .expect("startrake");
        assert!(wait_until(|| world.running("a") == 1));

        runner.shutdown();
        daemon.join().expect("join").expect("run");
        assert_eq!(world.running("a"), 0);
    }
}
