//! Starting task instances as child processes.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use crate::command::InvocationCommand;
use crate::error::ProcError;

/// Everything needed to start one instance of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub command: InvocationCommand,
    /// Overlaid on the supervisor's own environment.
    pub env: BTreeMap<String, String>,
    /// stdout and stderr are appended here when set, discarded otherwise.
    pub log_file: Option<PathBuf>,
}

impl LaunchRequest {
    pub fn new(command: InvocationCommand) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
            log_file: None,
        }
    }

    /// The command line as it would read in a shell, including redirection.
    pub fn describe(&self) -> String {
        match &self.log_file {
            Some(path) => format!("{} >> {}", self.command.render(), path.display()),
            None => self.command.render(),
        }
    }
}

pub trait Launch: Send + Sync {
    /// Start one instance and return its pid.
    fn launch(&self, request: &LaunchRequest) -> Result<u32, ProcError>;
}

/// Spawns instances as direct children of the current process. Each child
/// gets a reaper thread so it never lingers as a zombie after it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessLauncher;

impl Launch for ProcessLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<u32, ProcError> {
        let (stdout, stderr) = match &request.log_file {
            Some(path) => {
                let file = open_log(path)?;
                let dup = file.try_clone().map_err(|source| ProcError::LogFile {
                    path: path.clone(),
                    source,
                })?;
                (Stdio::from(file), Stdio::from(dup))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut child = Command::new(&request.command.interpreter)
            .args(request.command.args())
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| ProcError::Spawn {
                command: request.describe(),
                source,
            })?;

        let pid = child.id();
        let reaper = thread::Builder::new()
            .name(format!("reap-{pid}"))
            .spawn(move || {
                let _ = child.wait();
            });
        if let Err(source) = reaper {
            return Err(ProcError::Spawn {
                command: format!("reaper thread for pid {pid}"),
                source,
            });
        }
        Ok(pid)
    }
}

fn open_log(path: &Path) -> Result<File, ProcError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ProcError::LogFile {
            path: path.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ProcError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}
