//! Snapshots of the OS process table.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::error::ProcError;

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: u32,
    pub ppid: u32,
    pub argv: Vec<String>,
}

/// Something that can list every live process with its parent and command.
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> Result<Vec<ProcEntry>, ProcError>;
}

/// The process table of the running system.
pub fn system_table() -> Arc<dyn ProcessTable> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcFsTable::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(PsTable::default())
    }
}

/// Reads `/proc/<pid>/stat` and `/proc/<pid>/cmdline`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcFsTable {
    pub root: PathBuf,
}

impl Default for ProcFsTable {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcessTable for ProcFsTable {
    fn snapshot(&self) -> Result<Vec<ProcEntry>, ProcError> {
        let dir = fs::read_dir(&self.root).map_err(|source| ProcError::Table {
            context: self.root.display().to_string(),
            source,
        })?;

        let mut entries = Vec::new();
        for dirent in dir.flatten() {
            let Some(pid) = dirent
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes exit between listing and reading; skip those.
            if let Some(entry) = read_proc_entry(&dirent.path(), pid) {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|entry| entry.pid);
        Ok(entries)
    }
}

fn read_proc_entry(dir: &Path, pid: u32) -> Option<ProcEntry> {
    let stat = fs::read_to_string(dir.join("stat")).ok()?;
    let ppid = parse_stat_ppid(&stat)?;
    let cmdline = fs::read(dir.join("cmdline")).ok()?;
    Some(ProcEntry {
        pid,
        ppid,
        argv: parse_cmdline(&cmdline),
    })
}

/// `pid (comm) state ppid ...`; `comm` may itself contain spaces and parens.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|byte| *byte == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

/// Runs `ps -eo pid=,ppid=,args=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsTable {
    pub binary: PathBuf,
}

impl Default for PsTable {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ps"),
        }
    }
}

impl ProcessTable for PsTable {
    fn snapshot(&self) -> Result<Vec<ProcEntry>, ProcError> {
        let rendered = format!("{} -eo pid=,ppid=,args=", self.binary.display());
        let output = Command::new(&self.binary)
            .args(["-eo", "pid=,ppid=,args="])
            .output()
            .map_err(|source| ProcError::Table {
                context: rendered.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ProcError::Parse {
                context: format!("{rendered} exited with {:?}", output.status.code()),
            });
        }
        parse_ps_output(&String::from_utf8_lossy(&output.stdout))
    }
}

pub fn parse_ps_output(stdout: &str) -> Result<Vec<ProcEntry>, ProcError> {
    let mut entries = Vec::new();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(ppid)) = (fields.next(), fields.next()) else {
            continue;
        };
        let parse = |value: &str| {
            value.parse::<u32>().map_err(|_| ProcError::Parse {
                context: format!("bad pid column in ps line {line:?}"),
            })
        };
        entries.push(ProcEntry {
            pid: parse(pid)?,
            ppid: parse(ppid)?,
            argv: fields.map(str::to_string).collect(),
        });
    }
    Ok(entries)
}
