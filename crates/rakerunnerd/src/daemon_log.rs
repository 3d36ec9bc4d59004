//! Line-oriented daemon log: `YYYY-MM-DD HH:MM:SS - message`.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum DaemonLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
enum Sink {
    File { path: PathBuf, file: Mutex<File> },
    Stderr,
    Disabled,
}

/// Cheap to clone; clones share the same open file.
#[derive(Debug, Clone)]
pub struct DaemonLog {
    sink: Arc<Sink>,
    echo: bool,
}

impl DaemonLog {
    pub fn open(path: impl Into<PathBuf>, echo: bool) -> Result<Self, DaemonLogError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| DaemonLogError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| DaemonLogError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            sink: Arc::new(Sink::File {
                path,
                file: Mutex::new(file),
            }),
            echo,
        })
    }

    /// Opens `path`, falling back to stderr when the file cannot be opened.
    pub fn open_or_stderr(path: impl Into<PathBuf>, echo: bool) -> Self {
        match Self::open(path, echo) {
            Ok(log) => log,
            Err(err) => {
                let log = Self::stderr();
                log.error(&format!("{err}; logging to stderr"));
                log
            }
        }
    }

    pub fn stderr() -> Self {
        Self {
            sink: Arc::new(Sink::Stderr),
            echo: false,
        }
    }

    pub fn disabled() -> Self {
        Self {
            sink: Arc::new(Sink::Disabled),
            echo: false,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self.sink.as_ref() {
            Sink::File { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn info(&self, message: &str) {
        self.write(message);
    }

    pub fn warn(&self, message: &str) {
        self.write(&format!("warning: {message}"));
    }

    pub fn error(&self, message: &str) {
        self.write(&format!("error: {message}"));
    }

    fn write(&self, message: &str) {
        let line = format_line(&Local::now().format(TIMESTAMP_FORMAT).to_string(), message);
        match self.sink.as_ref() {
            Sink::Disabled => return,
            Sink::Stderr => eprintln!("{line}"),
            Sink::File { file, .. } => {
                let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                if writeln!(file, "{line}").and_then(|()| file.flush()).is_err() {
                    eprintln!("{line}");
                }
            }
        }
        if self.echo && !matches!(self.sink.as_ref(), Sink::Stderr) {
            eprintln!("{line}");
        }
    }
}

fn format_line(timestamp: &str, message: &str) -> String {
    format!("{timestamp} - {message}")
}
