//! State shared by the reconciliation loop and the command observer.

use rake_core::{ResolvedConfig, TaskSpec};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisionState {
    config: ResolvedConfig,
    /// Tasks this daemon has launched at least once and not since forgotten.
    pub started: BTreeSet<String>,
    /// Tasks an operator stopped; reconciliation leaves them alone.
    pub ignored: BTreeSet<String>,
    /// Set once shutdown begins. Nothing may be launched afterwards.
    pub shutting_down: bool,
}

impl SupervisionState {
    pub fn new(config: ResolvedConfig) -> Self {
        Self {
            config,
            started: BTreeSet::new(),
            ignored: BTreeSet::new(),
            shutting_down: false,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn configured(&self) -> &BTreeMap<String, TaskSpec> {
        &self.config.tasks
    }

    /// Swap in a freshly loaded configuration. The task table is replaced
    /// as a whole; started and ignored sets carry over.
    pub fn replace_config(&mut self, config: ResolvedConfig) {
        self.config = config;
    }

    pub fn is_ignored(&self, task: &str) -> bool {
        self.ignored.contains(task)
    }

    /// Every task name a pass needs to observe: configured plus started.
    pub fn tracked_tasks(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.config.tasks.keys().cloned().collect();
        names.extend(self.started.iter().cloned());
        names.into_iter().collect()
    }
}

/// Handle to the single lock guarding `SupervisionState`.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<SupervisionState>>,
}

impl SharedState {
    pub fn new(state: SupervisionState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// A panic inside a tick poisons the lock; the state itself is still
    /// consistent between transitions, so keep using it.
    pub fn lock(&self) -> MutexGuard<'_, SupervisionState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SupervisionState {
        self.lock().clone()
    }

    pub fn begin_shutdown(&self) {
        self.lock().shutting_down = true;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_world::resolved;
    use std::panic;

    fn two_tasks() -> ResolvedConfig {
        resolved(
            r#"
"*":
  rake_file: /srv/Rakefile
  daemon_dir: /var/run
  rakes:
    - rake: taskA
      qty: 2
    - rake: taskB
"#,
        )
    }

    #[test]
    fn tracked_tasks_unions_configured_and_started() {
        let mut state = SupervisionState::new(two_tasks());
        state.started.insert("retired".to_string());
        state.started.insert("taskA".to_string());
        assert_eq!(state.tracked_tasks(), vec!["retired", "taskA", "taskB"]);
    }

    #[test]
    fn replace_config_keeps_started_and_ignored() {
        let mut state = SupervisionState::new(two_tasks());
        state.started.insert("taskA".to_string());
        state.ignored.insert("taskB".to_string());

        state.replace_config(resolved(
            r#"
"*":
  rake_file: /srv/Rakefile
  daemon_dir: /var/run
  rakes:
    - rake: taskB
"#,
        ));
        assert!(!state.configured().contains_key("taskA"));
        assert!(state.started.contains("taskA"));
        assert!(state.is_ignored("taskB"));
    }

    #[test]
    fn shared_state_survives_a_poisoned_lock() {
        let shared = SharedState::new(SupervisionState::new(two_tasks()));
        let clone = shared.clone();
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let _guard = clone.lock();
            panic!("tick blew up");
        }));
        assert!(result.is_err());

        shared.begin_shutdown();
        assert!(shared.is_shutting_down());
        assert!(shared.snapshot().shutting_down);
    }
}
