//! Reconciliation loop: converge running instances toward the configured
//! quantities.
//!
//! `plan_pass()` is pure (state and observed groups in, actions out);
//! `execute_actions()` carries the actions out against a `TaskRuntime`.

use anyhow::Context;
use rake_core::{
    load_config_file, render_errors, ConfigError, ResolvedConfig, StartupPaths, Validate,
    ValidationLevel,
};
use rake_proc::{ObservedGroups, ProcessGroup};
use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::daemon_log::DaemonLog;
use crate::runtime::TaskRuntime;
use crate::state::{SharedState, SupervisionState};

/// Pause between ticks of the main loop.
pub const IDLE_SLEEP: Duration = Duration::from_secs(5);
const SHUTDOWN_CHECK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Configured but exempted by an operator stop.
    Skip { task: String },
    Launch { task: String, count: u32 },
    Terminate {
        task: String,
        groups: Vec<ProcessGroup>,
        reason: String,
    },
    /// Drop a task from the started set.
    Forget { task: String },
}

/// Work out what one pass has to do.
pub fn plan_pass(state: &SupervisionState, observed: &ObservedGroups) -> Vec<ReconcileAction> {
    let mut actions = Vec::new();
    if state.shutting_down {
        return actions;
    }
    let no_groups = Vec::new();

    for (name, spec) in state.configured() {
        if state.is_ignored(name) {
            actions.push(ReconcileAction::Skip { task: name.clone() });
            continue;
        }
        let groups = observed.get(name).unwrap_or(&no_groups);
        let running = groups.len();
        let wanted = spec.qty as usize;
        if running < wanted {
            actions.push(ReconcileAction::Launch {
                task: name.clone(),
                count: spec.qty - running as u32,
            });
        } else if running > wanted {
            actions.push(ReconcileAction::Terminate {
                task: name.clone(),
                groups: groups[..running - wanted].to_vec(),
                reason: format!("process count {running} greater than {wanted}"),
            });
        }
    }

    for name in &state.started {
        if state.configured().contains_key(name) || state.is_ignored(name) {
            continue;
        }
        actions.push(ReconcileAction::Terminate {
            task: name.clone(),
            groups: observed.get(name).cloned().unwrap_or_default(),
            reason: "no longer in config".to_string(),
        });
        actions.push(ReconcileAction::Forget { task: name.clone() });
    }

    actions
}

pub fn execute_actions(
    actions: &[ReconcileAction],
    state: &mut SupervisionState,
    runtime: &TaskRuntime,
    log: &DaemonLog,
) {
    for action in actions {
        match action {
            ReconcileAction::Skip { task } => {
                log.info(&format!("rake {task} in ignore set; skipping"));
            }
            ReconcileAction::Launch { task, count } => {
                if state.shutting_down {
                    log.warn(&format!("not starting {task}: shutting down"));
                    continue;
                }
                state.started.insert(task.clone());
                if let Err(err) = runtime.launch_instances(state.config(), task, *count, log) {
                    log.error(&format!("failed to start {task}: {err}"));
                }
            }
            ReconcileAction::Terminate {
                task,
                groups,
                reason,
            } => {
                log.info(&format!("rake {task}: {reason}"));
                runtime.terminate_groups(task, groups, log);
            }
            ReconcileAction::Forget { task } => {
                state.started.remove(task);
            }
        }
    }
}

/// One complete pass under the state lock.
pub fn reconcile_pass(
    shared: &SharedState,
    runtime: &TaskRuntime,
    log: &DaemonLog,
) -> anyhow::Result<Vec<ReconcileAction>> {
    let mut state = shared.lock();
    if state.shutting_down {
        return Ok(Vec::new());
    }
    let observed = runtime
        .observe(&state.tracked_tasks())
        .context("failed to observe task processes")?;
    let actions = plan_pass(&state, &observed);
    execute_actions(&actions, &mut state, runtime, log);
    Ok(actions)
}

/// Where reloaded configuration comes from.
pub trait ConfigSource: Send {
    fn load(&mut self) -> Result<ResolvedConfig, ConfigError>;
}

/// Reads, validates and resolves the config file for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConfigSource {
    pub path: PathBuf,
    pub hostname: String,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>, hostname: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hostname: hostname.into(),
        }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&mut self) -> Result<ResolvedConfig, ConfigError> {
        let file = load_config_file(&self.path)?;
        let issues = file.validate();
        if let Some(issues) = render_errors(&issues) {
            return Err(ConfigError::Invalid { issues });
        }
        let mut resolved = file.resolve(&self.hostname)?;
        resolved.warnings.extend(
            issues
                .iter()
                .filter(|issue| issue.level == ValidationLevel::Warning)
                .map(|issue| format!("[{}] {}", issue.code, issue.message)),
        );
        Ok(resolved)
    }
}

pub struct ReconcileLoop {
    state: SharedState,
    runtime: Arc<TaskRuntime>,
    source: Box<dyn ConfigSource>,
    startup: StartupPaths,
    log: DaemonLog,
    idle: Duration,
}

impl ReconcileLoop {
    pub fn new(
        state: SharedState,
        runtime: Arc<TaskRuntime>,
        source: Box<dyn ConfigSource>,
        startup: StartupPaths,
        log: DaemonLog,
    ) -> Self {
        Self {
            state,
            runtime,
            source,
            startup,
            log,
            idle: IDLE_SLEEP,
        }
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Load the config again and swap it in. On failure the previous
    /// configuration stays in effect.
    pub fn reload_config(&mut self) -> Result<(), ConfigError> {
        let config = self.source.load()?;
        for warning in &config.warnings {
            self.log.warn(warning);
        }
        self.warn_if_changed("rake_file", config.rake_file.as_deref(), &self.startup.rake_file);
        self.warn_if_changed(
            "daemon_dir",
            config.daemon_dir.as_deref(),
            &self.startup.daemon_dir,
        );
        self.state.lock().replace_config(config);
        Ok(())
    }

    fn warn_if_changed(&self, field: &str, reloaded: Option<&Path>, current: &Path) {
        if reloaded == Some(current) {
            return;
        }
        let reloaded = reloaded
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "(unset)".to_string());
        self.log.warn(&format!(
            "{field} changed to {reloaded}; restart required, still using {}",
            current.display()
        ));
    }

    /// Optionally reload, then run one pass.
    pub fn tick(&mut self, reload: bool) -> anyhow::Result<Vec<ReconcileAction>> {
        if reload {
            self.log.info("reloading conf");
            if let Err(err) = self.reload_config() {
                self.log.warn(&format!("{err}; keeping previous configuration"));
            }
        }
        reconcile_pass(&self.state, &self.runtime, &self.log)
    }

    /// Like `tick`, but an error or panic is logged instead of propagated.
    /// Returns whether the tick completed.
    pub fn guarded_tick(&mut self, reload: bool) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| self.tick(reload))) {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                self.log.error(&format!(
                    "reconcile tick failed: {err:#}\n{}",
                    Backtrace::force_capture()
                ));
                false
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.log.error(&format!("reconcile tick panicked: {message}"));
                false
            }
        }
    }

    /// First pass immediately, then reload and pass whenever the reload
    /// interval has elapsed. Returns once shutdown begins.
    pub fn run(&mut self) {
        self.guarded_tick(false);
        let mut last_reload = Instant::now();
        while !self.state.is_shutting_down() {
            self.idle_sleep();
            let interval = self.state.lock().config().reload_interval;
            if last_reload.elapsed() >= interval && !self.state.is_shutting_down() {
                self.guarded_tick(true);
                last_reload = Instant::now();
            }
        }
        self.log.info("reconcile loop stopped");
    }

    fn idle_sleep(&self) {
        let deadline = Instant::now() + self.idle;
        while Instant::now() < deadline && !self.state.is_shutting_down() {
            thread::sleep(SHUTDOWN_CHECK.min(self.idle));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Route panic reports, with a captured backtrace, into the daemon log.
/// A detached daemon has no stderr to print them on.
pub fn install_panic_logging(log: DaemonLog) {
    panic::set_hook(Box::new(move |info| {
        log.error(&format!("{info}\n{}", Backtrace::force_capture()));
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_world::FakeWorld;
    use crate::fake_world::resolved;
    use std::collections::VecDeque;
    use std::fs;

    fn config_with(rakes: &str) -> ResolvedConfig {
        resolved(&format!(
            "\"*\":\n  rake_file: /srv/Rakefile\n  daemon_dir: /var/run\n  rakes:\n{rakes}"
        ))
    }

    fn shared(config: ResolvedConfig) -> SharedState {
        SharedState::new(SupervisionState::new(config))
    }

    fn pass(state: &SharedState, world: &FakeWorld) -> Vec<ReconcileAction> {
        reconcile_pass(state, &world.runtime(), &DaemonLog::disabled()).expect("pass")
    }

    // -----------------------------------------------------------------------
    // plan_pass
    // -----------------------------------------------------------------------

    #[test]
    fn plan_launches_shortfall_and_culls_oldest_excess() {
        let state = SupervisionState::new(config_with(
            "    - rake: a\n      qty: 3\n    - rake: b\n      qty: 1\n",
        ));
        let mut observed = ObservedGroups::new();
        observed.insert("a".to_string(), vec![ProcessGroup::new(10)]);
        observed.insert(
            "b".to_string(),
            vec![ProcessGroup::new(20), ProcessGroup::new(21), ProcessGroup::new(22)],
        );

        let actions = plan_pass(&state, &observed);
        assert_eq!(
            actions[0],
            ReconcileAction::Launch {
                task: "a".to_string(),
                count: 2,
            }
        );
        match &actions[1] {
            ReconcileAction::Terminate { task, groups, .. } => {
                assert_eq!(task, "b");
                assert_eq!(groups, &vec![ProcessGroup::new(20), ProcessGroup::new(21)]);
            }
            other => panic!("expected terminate, got {other:?}"),
        }
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn plan_is_empty_once_shutting_down() {
        let mut state = SupervisionState::new(config_with("    - rake: a\n      qty: 3\n"));
        state.shutting_down = true;
        assert!(plan_pass(&state, &ObservedGroups::new()).is_empty());
    }

    // -----------------------------------------------------------------------
    // convergence against the fake process world
    // -----------------------------------------------------------------------

    #[test]
    fn passes_converge_to_configured_quantity() {
        for qty in [0u32, 1, 5] {
            let world = FakeWorld::new();
            // Leftovers from a previous run must be culled when qty is 0.
            world.spawn_owned("jobs:work");
            world.spawn_owned("jobs:work");
            let state = shared(config_with(&format!(
                "    - rake: jobs:work\n      qty: {qty}\n"
            )));

            pass(&state, &world);
            assert_eq!(world.running("jobs:work"), qty as usize, "qty {qty}");

            let launched = world.launched().len();
            let second = pass(&state, &world);
            assert!(second.is_empty(), "qty {qty}: converged pass does nothing");
            assert_eq!(world.launched().len(), launched);
        }
    }

    #[test]
    fn foreign_instances_are_neither_counted_nor_stopped() {
        let world = FakeWorld::new();
        let foreign = world.spawn_foreign("jobs:work");
        let state = shared(config_with("    - rake: jobs:work\n      qty: 1\n"));

        pass(&state, &world);
        assert_eq!(world.running("jobs:work"), 1);
        assert!(world.is_running(foreign));
    }

    #[test]
    fn ignored_tasks_are_never_started_or_stopped() {
        let world = FakeWorld::new();
        world.spawn_owned("b");
        world.spawn_owned("b");
        world.spawn_owned("b");
        let state = shared(config_with(
            "    - rake: a\n      qty: 2\n    - rake: b\n      qty: 1\n",
        ));
        {
            let mut guard = state.lock();
            guard.ignored.insert("a".to_string());
            guard.ignored.insert("b".to_string());
        }

        let actions = pass(&state, &world);
        assert_eq!(world.running("a"), 0);
        assert_eq!(world.running("b"), 3);
        assert!(actions
            .iter()
            .all(|action| matches!(action, ReconcileAction::Skip { .. })));
    }

    #[test]
    fn removed_tasks_are_stopped_and_forgotten() {
        let world = FakeWorld::new();
        let state = shared(config_with(
            "    - rake: taskA\n      qty: 2\n    - rake: taskB\n      qty: 1\n",
        ));

        pass(&state, &world);
        assert_eq!(world.running("taskA"), 2);
        assert_eq!(world.running("taskB"), 1);
        assert_eq!(
            state.snapshot().started.into_iter().collect::<Vec<_>>(),
            vec!["taskA", "taskB"]
        );

        state
            .lock()
            .replace_config(config_with("    - rake: taskB\n      qty: 1\n"));
        pass(&state, &world);
        assert_eq!(world.running("taskA"), 0);
        assert_eq!(world.running("taskB"), 1);
        assert!(!state.snapshot().started.contains("taskA"));
    }

    #[test]
    fn ignored_orphans_are_left_running() {
        let world = FakeWorld::new();
        world.spawn_owned("retired");
        let state = shared(config_with("    - rake: a\n      qty: 0\n"));
        {
            let mut guard = state.lock();
            guard.started.insert("retired".to_string());
            guard.ignored.insert("retired".to_string());
        }
        pass(&state, &world);
        assert_eq!(world.running("retired"), 1);
        assert!(state.snapshot().started.contains("retired"));
    }

    #[test]
    fn nothing_launches_after_shutdown_begins() {
        let world = FakeWorld::new();
        let state = shared(config_with("    - rake: a\n      qty: 2\n"));
        state.begin_shutdown();
        assert!(pass(&state, &world).is_empty());
        assert!(world.launched().is_empty());

        // Even a plan computed before shutdown is refused by the executor.
        let mut guard = state.lock();
        execute_actions(
            &[ReconcileAction::Launch {
                task: "a".to_string(),
                count: 2,
            }],
            &mut guard,
            &world.runtime(),
            &DaemonLog::disabled(),
        );
        assert!(world.launched().is_empty());
    }

    #[test]
    fn failed_launch_still_marks_task_started() {
        let world = FakeWorld::new();
        world.fail_launches();
        let state = shared(config_with("    - rake: a\n      qty: 1\n"));
        pass(&state, &world);
        assert_eq!(world.running("a"), 0);
        assert!(state.snapshot().started.contains("a"));
    }

    // -----------------------------------------------------------------------
    // ReconcileLoop
    // -----------------------------------------------------------------------

    struct Scripted(VecDeque<Result<ResolvedConfig, ConfigError>>);

    impl ConfigSource for Scripted {
        fn load(&mut self) -> Result<ResolvedConfig, ConfigError> {
            self.0
                .pop_front()
                .unwrap_or(Err(ConfigError::MissingField { field: "rakes" }))
        }
    }

    struct Panicking;

    impl ConfigSource for Panicking {
        fn load(&mut self) -> Result<ResolvedConfig, ConfigError> {
            panic!("config source exploded");
        }
    }

    fn startup() -> StartupPaths {
        StartupPaths {
            rake_file: PathBuf::from("/srv/Rakefile"),
            daemon_dir: PathBuf::from("/var/run"),
        }
    }

    fn reconcile_loop(
        world: &FakeWorld,
        state: &SharedState,
        source: Box<dyn ConfigSource>,
        log: DaemonLog,
    ) -> ReconcileLoop {
        ReconcileLoop::new(
            state.clone(),
            Arc::new(world.runtime()),
            source,
            startup(),
            log,
        )
    }

    #[test]
    fn failed_reload_keeps_previous_configuration() {
        let world = FakeWorld::new();
        let state = shared(config_with("    - rake: a\n      qty: 2\n"));
        let mut looped = reconcile_loop(
            &world,
            &state,
            Box::new(Scripted(VecDeque::new())),
            DaemonLog::disabled(),
        );

        assert!(looped.guarded_tick(true));
        assert_eq!(world.running("a"), 2);
        assert_eq!(state.snapshot().configured()["a"].qty, 2);
    }

    #[test]
    fn changed_startup_paths_warn_and_are_not_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("rakerunner.log");
        let world = FakeWorld::new();
        let state = shared(config_with("    - rake: a\n      qty: 1\n"));
        let reloaded = resolved(
            "\"*\":\n  rake_file: /srv/Other\n  daemon_dir: /var/run\n  rakes:\n    - rake: a\n      qty: 3\n",
        );
        let mut looped = reconcile_loop(
            &world,
            &state,
            Box::new(Scripted(VecDeque::from([Ok(reloaded)]))),
            DaemonLog::open(&log_path, false).expect("log"),
        );

        looped.tick(true).expect("tick");
        assert_eq!(world.running("a"), 3);
        let body = fs::read_to_string(&log_path).expect("read log");
        assert!(body.contains("rake_file changed to /srv/Other; restart required"));
        assert!(!body.contains("daemon_dir changed"));
    }

    #[test]
    fn panicking_tick_is_logged_and_survived() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("rakerunner.log");
        let world = FakeWorld::new();
        let state = shared(config_with("    - rake: a\n      qty: 1\n"));
        let mut looped = reconcile_loop(
            &world,
            &state,
            Box::new(Panicking),
            DaemonLog::open(&log_path, false).expect("log"),
        );

        assert!(!looped.guarded_tick(true));
        assert!(looped.guarded_tick(false));
        assert_eq!(world.running("a"), 1);
        let body = fs::read_to_string(&log_path).expect("read log");
        assert!(body.contains("reconcile tick panicked: config source exploded"));
    }

    #[test]
    fn run_returns_once_shutdown_begins() {
        let world = FakeWorld::new();
        let state = shared(config_with("    - rake: a\n      qty: 1\n"));
        let mut looped = reconcile_loop(
            &world,
            &state,
            Box::new(Scripted(VecDeque::new())),
            DaemonLog::disabled(),
        )
        .with_idle(Duration::from_millis(20));

        let stopper = state.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            stopper.begin_shutdown();
        });
        looped.run();
        handle.join().expect("join");
        assert_eq!(world.running("a"), 1);
    }

    #[test]
    fn file_source_rejects_invalid_config_and_keeps_warnings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rakerunner.conf");
        fs::write(
            &path,
            "\"*\":\n  rake_file: Rakefile\n  rakes:\n    - rake: a\n    - qty: 2\n",
        )
        .expect("write");
        let resolved = FileConfigSource::new(&path, "web1").load().expect("load");
        assert_eq!(resolved.rake_file, Some(dir.path().join("Rakefile")));
        assert!(resolved
            .warnings
            .iter()
            .any(|warning| warning.contains("rakes.name.missing")));

        fs::write(&path, "\"*\":\n  rakes:\n    - rake: a b\n").expect("write");
        assert!(matches!(
            FileConfigSource::new(&path, "web1").load(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn file_source_lets_the_last_duplicate_entry_win() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rakerunner.conf");
        fs::write(
            &path,
            "\"*\":\n  rakes:\n    - rake: a\n      qty: 1\n    - rake: a\n      qty: 3\n",
        )
        .expect("write");
        let resolved = FileConfigSource::new(&path, "web1").load().expect("load");
        assert_eq!(resolved.tasks["a"].qty, 3);
        assert!(resolved
            .warnings
            .iter()
            .any(|warning| warning.contains("rakes.name.duplicate")));
        assert!(resolved
            .warnings
            .iter()
            .any(|warning| warning.contains("last entry wins")));
    }
}
