//! In-memory process world for exercising reconciliation without forking.

use rake_core::{parse_config, ResolvedConfig};
use rake_proc::{
    InvocationTemplate, Launch, LaunchRequest, ProcEntry, ProcError, ProcessRegistry,
    ProcessTable, Terminate, Termination,
};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use crate::runtime::TaskRuntime;

pub const SUPERVISOR_PID: u32 = 1000;
const FOREIGN_PID: u32 = 1;

/// Resolve a YAML config body as host `testhost`.
pub fn resolved(yaml: &str) -> ResolvedConfig {
    parse_config("/etc/rakerunner.conf", yaml)
        .expect("parse")
        .resolve("testhost")
        .expect("resolve")
}

#[derive(Debug, Default)]
struct Inner {
    next_pid: u32,
    procs: BTreeMap<u32, ProcEntry>,
    launched: Vec<String>,
    terminated: Vec<u32>,
    fail_launches: bool,
}

#[derive(Debug, Clone)]
pub struct FakeWorld {
    inner: Arc<Mutex<Inner>>,
}

impl FakeWorld {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_pid: 2000,
                ..Inner::default()
            })),
        }
    }

    pub fn template() -> InvocationTemplate {
        InvocationTemplate::new("/usr/bin/rake", "/srv/Rakefile")
    }

    pub fn runtime(&self) -> TaskRuntime {
        TaskRuntime::new(
            ProcessRegistry::with_supervisor_pid(
                Arc::new(self.clone()),
                Self::template(),
                SUPERVISOR_PID,
            ),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    fn spawn(&self, ppid: u32, argv: Vec<String>) -> u32 {
        let mut inner = self.inner.lock().expect("lock");
        inner.next_pid += 1;
        let pid = inner.next_pid;
        inner.procs.insert(pid, ProcEntry { pid, ppid, argv });
        pid
    }

    /// An instance of `task` owned by some other supervisor.
    pub fn spawn_foreign(&self, task: &str) -> u32 {
        self.spawn(FOREIGN_PID, Self::template().for_task(task).argv())
    }

    /// An instance of `task` left over from before this supervisor started
    /// launching, but parented to it.
    pub fn spawn_owned(&self, task: &str) -> u32 {
        self.spawn(SUPERVISOR_PID, Self::template().for_task(task).argv())
    }

    pub fn add_child(&self, parent: u32) -> u32 {
        self.spawn(parent, vec!["sh".to_string(), "-c".to_string(), "work".to_string()])
    }

    pub fn fail_launches(&self) {
        self.inner.lock().expect("lock").fail_launches = true;
    }

    /// Instances of `task` parented to the supervisor.
    pub fn running(&self, task: &str) -> usize {
        let command = Self::template().for_task(task);
        self.inner
            .lock()
            .expect("lock")
            .procs
            .values()
            .filter(|entry| entry.ppid == SUPERVISOR_PID && command.matches(&entry.argv))
            .count()
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.inner.lock().expect("lock").procs.contains_key(&pid)
    }

    /// Task names in launch order.
    pub fn launched(&self) -> Vec<String> {
        self.inner.lock().expect("lock").launched.clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.inner.lock().expect("lock").terminated.clone()
    }
}

impl ProcessTable for FakeWorld {
    fn snapshot(&self) -> Result<Vec<ProcEntry>, ProcError> {
        Ok(self.inner.lock().expect("lock").procs.values().cloned().collect())
    }
}

impl Launch for FakeWorld {
    fn launch(&self, request: &LaunchRequest) -> Result<u32, ProcError> {
        if self.inner.lock().expect("lock").fail_launches {
            return Err(ProcError::Spawn {
                command: request.describe(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such interpreter"),
            });
        }
        let pid = self.spawn(SUPERVISOR_PID, request.command.argv());
        self.inner
            .lock()
            .expect("lock")
            .launched
            .push(request.command.task.clone());
        Ok(pid)
    }
}

impl Terminate for FakeWorld {
    fn terminate(&self, pid: u32) -> Result<Termination, ProcError> {
        let mut inner = self.inner.lock().expect("lock");
        inner.terminated.push(pid);
        match inner.procs.remove(&pid) {
            Some(_) => Ok(Termination::Exited),
            None => Ok(Termination::AlreadyGone),
        }
    }
}
