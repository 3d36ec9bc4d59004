//! Process operations shared by the reconcile loop and the command observer.

use rake_core::ResolvedConfig;
use rake_proc::{
    system_table, InvocationTemplate, Launch, LaunchRequest, ObservedGroups, ProcError,
    ProcessGroup, ProcessLauncher, ProcessRegistry, SignalTerminator, Terminate, Termination,
};
use std::sync::Arc;

use crate::daemon_log::DaemonLog;

pub struct TaskRuntime {
    registry: ProcessRegistry,
    launcher: Arc<dyn Launch>,
    terminator: Arc<dyn Terminate>,
}

impl TaskRuntime {
    pub fn new(
        registry: ProcessRegistry,
        launcher: Arc<dyn Launch>,
        terminator: Arc<dyn Terminate>,
    ) -> Self {
        Self {
            registry,
            launcher,
            terminator,
        }
    }

    /// Real processes, discovered as children of the current pid.
    pub fn system(template: InvocationTemplate) -> Self {
        Self::new(
            ProcessRegistry::new(system_table(), template),
            Arc::new(ProcessLauncher),
            Arc::new(SignalTerminator::default()),
        )
    }

    pub fn observe(&self, tasks: &[String]) -> Result<ObservedGroups, ProcError> {
        self.registry.groups(tasks)
    }

    pub fn request_for(&self, config: &ResolvedConfig, task: &str) -> LaunchRequest {
        LaunchRequest {
            command: self.registry.template().for_task(task),
            env: config.env_vars.clone(),
            log_file: config.task_log_path(task),
        }
    }

    /// Start `count` instances, stopping at the first failure.
    pub fn launch_instances(
        &self,
        config: &ResolvedConfig,
        task: &str,
        count: u32,
        log: &DaemonLog,
    ) -> Result<Vec<u32>, ProcError> {
        log.info(&format!("starting {count} instances of {task}"));
        let request = self.request_for(config, task);
        let mut pids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            log.info(&format!("running: {}", request.describe()));
            pids.push(self.launcher.launch(&request)?);
        }
        Ok(pids)
    }

    /// Terminate each group, parent first. Failures are logged and skipped.
    pub fn terminate_groups(&self, task: &str, groups: &[ProcessGroup], log: &DaemonLog) {
        for group in groups {
            for pid in group.pids() {
                if pid == group.pid {
                    log.info(&format!("stopping {task}: sending TERM to pid {pid}"));
                } else {
                    log.info(&format!(
                        "stopping {task}: sending TERM to pid {pid} (child of {})",
                        group.pid
                    ));
                }
                match self.terminator.terminate(pid) {
                    Ok(Termination::AlreadyGone) => {
                        log.info(&format!("pid {pid} already stopped"));
                    }
                    Ok(Termination::Killed) => {
                        log.info(&format!("pid {pid} ignored TERM; sent KILL"));
                    }
                    Ok(Termination::Exited) => {}
                    Err(err) => log.error(&err.to_string()),
                }
            }
        }
    }

    /// Terminate every running instance of `task`; returns how many there were.
    pub fn stop_task(&self, task: &str, log: &DaemonLog) -> Result<usize, ProcError> {
        log.info(&format!("stopping all instances of {task}"));
        let groups = self.registry.groups_for(task)?;
        if groups.is_empty() {
            log.info(&format!("no pids for {task}"));
        }
        self.terminate_groups(task, &groups, log);
        Ok(groups.len())
    }
}
