//! Core types for the rake supervisor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Instance count used when a task entry (or a `startrake` for an
/// unconfigured task) does not name one.
pub const DEFAULT_QTY: u32 = 1;

/// A configured unit of work: keep `qty` instances of `name` running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub qty: u32,
    /// Absolute path the task's output is appended to, if set per task.
    #[serde(default)]
    pub log: Option<PathBuf>,
}

/// Returns true when `name` can be used as a task identity.
///
/// A task name ends up as a single argv token of the invocation command and
/// is matched back against the process table token-by-token, so it must be
/// non-empty and free of whitespace.
pub fn is_valid_task_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_whitespace)
}
