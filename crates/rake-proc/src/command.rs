//! Invocation commands: how a task is started and how it is recognized
//! again in the process table.

use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::ProcError;

/// Flag passed to the interpreter ahead of the task file.
pub const TASK_FILE_FLAG: &str = "-f";

/// The part of an invocation shared by every task: interpreter and task file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationTemplate {
    pub interpreter: PathBuf,
    pub task_file: PathBuf,
}

impl InvocationTemplate {
    pub fn new(interpreter: impl Into<PathBuf>, task_file: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            task_file: task_file.into(),
        }
    }

    pub fn for_task(&self, task: &str) -> InvocationCommand {
        InvocationCommand {
            interpreter: self.interpreter.clone(),
            task_file: self.task_file.clone(),
            task: task.to_string(),
        }
    }
}

/// `<interpreter> -f <task_file> <task>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationCommand {
    pub interpreter: PathBuf,
    pub task_file: PathBuf,
    pub task: String,
}

impl InvocationCommand {
    /// Arguments after the program itself.
    pub fn args(&self) -> Vec<String> {
        vec![
            TASK_FILE_FLAG.to_string(),
            self.task_file.to_string_lossy().into_owned(),
            self.task.clone(),
        ]
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.interpreter.to_string_lossy().into_owned()];
        argv.extend(self.args());
        argv
    }

    pub fn render(&self) -> String {
        self.argv().join(" ")
    }

    /// Whole-token match: the invocation's tokens must appear as a contiguous
    /// run inside `argv`. Interpreters launched through a shebang show up with
    /// extra leading tokens, which the window search tolerates, while
    /// `jobs:work` never matches a process running `jobs:work2`.
    pub fn matches(&self, argv: &[String]) -> bool {
        let own = self.argv();
        let needle: Vec<&str> = tokens(&own);
        if needle.is_empty() {
            return false;
        }
        let haystack: Vec<&str> = tokens(argv);
        haystack
            .windows(needle.len())
            .any(|window| window == needle.as_slice())
    }
}

fn tokens(argv: &[String]) -> Vec<&str> {
    argv.iter().flat_map(|arg| arg.split_whitespace()).collect()
}

/// Resolve `program` to an absolute path using `$PATH`, the way a shell would.
pub fn resolve_program(program: &str) -> Result<PathBuf, ProcError> {
    resolve_program_in(program, std::env::var_os("PATH").as_deref())
}

pub fn resolve_program_in(program: &str, path_var: Option<&OsStr>) -> Result<PathBuf, ProcError> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(ProcError::ProgramNotFound {
            program: program.to_string(),
        });
    }

    let found = path_var
        .map(|paths| std::env::split_paths(paths).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_absolute() && is_executable(candidate));

    found.ok_or_else(|| ProcError::ProgramNotFound {
        program: program.to_string(),
    })
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
