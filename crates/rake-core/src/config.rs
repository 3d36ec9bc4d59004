//! Configuration file shape and host resolution.
//!
//! The file is a YAML mapping keyed by hostname plus a `*` wildcard entry.
//! Host entries take precedence over the wildcard field-by-field.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::types::{TaskSpec, DEFAULT_QTY};

pub const WILDCARD_HOST: &str = "*";
pub const CONF_ENV_VAR: &str = "RAKERUNNER_CONF";
pub const CONF_FILE_NAME: &str = "rakerunner.conf";
pub const DEFAULT_INTERPRETER: &str = "rake";
/// Ten minutes between configuration reloads.
pub const DEFAULT_RELOAD_WAIT_SECS: u64 = 60 * 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no config file found (searched: {searched})")]
    NotFound { searched: String },
    #[error("no entry for {hostname} or * found in {path}")]
    NoHostEntry { hostname: String, path: PathBuf },
    #[error("no {field} specified")]
    MissingField { field: &'static str },
    #[error("{field} {path} does not exist")]
    MissingPath { field: &'static str, path: PathBuf },
    #[error("daemon_dir {path} is not a directory")]
    NotADirectory { path: PathBuf },
    #[error("config has errors: {issues}")]
    Invalid { issues: String },
    #[error("failed to resolve config path {path} against the working directory: {source}")]
    WorkingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A scalar YAML value used for environment variables, so `PORT: 3000`
/// works as well as `PORT: "3000"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ScalarValue {
    pub fn render(&self) -> String {
        match self {
            ScalarValue::Bool(v) => v.to_string(),
            ScalarValue::Int(v) => v.to_string(),
            ScalarValue::Float(v) => v.to_string(),
            ScalarValue::Str(v) => v.clone(),
        }
    }
}

/// One `rakes:` list entry as written in the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RakeEntry {
    #[serde(default)]
    pub rake: Option<String>,
    #[serde(default)]
    pub qty: Option<u32>,
    #[serde(default)]
    pub log: Option<PathBuf>,
}

/// Settings for one host key (or the wildcard). Every field is optional so
/// that host and wildcard entries can be merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub rake_file: Option<PathBuf>,
    #[serde(default)]
    pub daemon_dir: Option<PathBuf>,
    #[serde(default)]
    pub conf_reload_wait: Option<u64>,
    #[serde(default)]
    pub env_vars: Option<BTreeMap<String, ScalarValue>>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub rake_logging: Option<bool>,
    #[serde(default)]
    pub rake_log_dir: Option<PathBuf>,
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub rakes: Option<Vec<RakeEntry>>,
}

/// A parsed configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub hosts: BTreeMap<String, HostConfig>,
}

/// Host-resolved configuration with every path made absolute.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub conf_file: PathBuf,
    pub rake_file: Option<PathBuf>,
    pub daemon_dir: Option<PathBuf>,
    pub reload_interval: Duration,
    pub env_vars: BTreeMap<String, String>,
    pub debug: bool,
    pub rake_logging: bool,
    pub rake_log_dir: Option<PathBuf>,
    pub interpreter: String,
    pub tasks: BTreeMap<String, TaskSpec>,
    /// Non-fatal problems found while resolving (e.g. entries without a name).
    pub warnings: Vec<String>,
}

/// The paths fixed for the lifetime of a daemon; a reload may not change them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPaths {
    pub rake_file: PathBuf,
    pub daemon_dir: PathBuf,
}

pub fn parse_config(path: impl Into<PathBuf>, contents: &str) -> Result<ConfigFile, ConfigError> {
    let path = path.into();
    let hosts: BTreeMap<String, Option<HostConfig>> =
        serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
    let hosts = hosts
        .into_iter()
        .map(|(host, cfg)| (host, cfg.unwrap_or_default()))
        .collect();
    Ok(ConfigFile { path, hosts })
}

pub fn load_config_file(path: impl AsRef<Path>) -> Result<ConfigFile, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_config(path_ref, &body)
}

/// Locate the config file: `$RAKERUNNER_CONF`, then `./rakerunner.conf`,
/// then `/etc/rakerunner.conf`.
pub fn find_config() -> Result<PathBuf, ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_config_in(std::env::var_os(CONF_ENV_VAR), &cwd, Path::new("/etc"))
}

/// Anchor a config path given on the command line to the working directory
/// so it survives the daemon's `chdir("/")`.
pub fn expand_config_path(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        return Ok(absolutize(Path::new("/"), path));
    }
    let cwd = std::env::current_dir().map_err(|source| ConfigError::WorkingDir {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(absolutize(&cwd, path))
}

pub fn find_config_in(
    env_value: Option<OsString>,
    cwd: &Path,
    etc_dir: &Path,
) -> Result<PathBuf, ConfigError> {
    let mut candidates = Vec::new();
    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        candidates.push(absolutize(cwd, Path::new(&value)));
    }
    candidates.push(cwd.join(CONF_FILE_NAME));
    candidates.push(etc_dir.join(CONF_FILE_NAME));

    if let Some(found) = candidates.iter().find(|path| path.is_file()) {
        return Ok(found.clone());
    }
    let searched = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(ConfigError::NotFound { searched })
}

impl ConfigFile {
    pub fn conf_dir(&self) -> PathBuf {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("/"));
        if parent.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            parent.to_path_buf()
        }
    }

    /// Merge the wildcard and `hostname` entries into one configuration.
    pub fn resolve(&self, hostname: &str) -> Result<ResolvedConfig, ConfigError> {
        let global = self.hosts.get(WILDCARD_HOST);
        let local = self.hosts.get(hostname);
        if global.is_none() && local.is_none() {
            return Err(ConfigError::NoHostEntry {
                hostname: hostname.to_string(),
                path: self.path.clone(),
            });
        }
        let empty = HostConfig::default();
        let global = global.unwrap_or(&empty);
        let local = local.unwrap_or(&empty);
        let conf_dir = self.conf_dir();
        let resolve_path = |path: &PathBuf| absolutize(&conf_dir, path);

        let mut warnings = Vec::new();
        let mut tasks = BTreeMap::new();
        let entries = local.rakes.as_ref().or(global.rakes.as_ref());
        for entry in entries.into_iter().flatten() {
            let Some(name) = entry.rake.as_ref().filter(|n| !n.trim().is_empty()) else {
                warnings.push(format!("no rake name for entry {entry:?}"));
                continue;
            };
            let spec = TaskSpec {
                name: name.clone(),
                qty: entry.qty.unwrap_or(DEFAULT_QTY),
                log: entry.log.as_ref().map(resolve_path),
            };
            if tasks.insert(name.clone(), spec).is_some() {
                warnings.push(format!("rake {name} configured more than once; last entry wins"));
            }
        }

        let env_vars = local
            .env_vars
            .as_ref()
            .or(global.env_vars.as_ref())
            .map(|vars| {
                vars.iter()
                    .map(|(key, value)| (key.clone(), value.render()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(ResolvedConfig {
            conf_file: self.path.clone(),
            rake_file: local.rake_file.as_ref().or(global.rake_file.as_ref()).map(resolve_path),
            daemon_dir: local
                .daemon_dir
                .as_ref()
                .or(global.daemon_dir.as_ref())
                .map(resolve_path),
            reload_interval: Duration::from_secs(
                local
                    .conf_reload_wait
                    .or(global.conf_reload_wait)
                    .unwrap_or(DEFAULT_RELOAD_WAIT_SECS),
            ),
            env_vars,
            debug: local.debug.or(global.debug).unwrap_or(false),
            rake_logging: local.rake_logging.or(global.rake_logging).unwrap_or(false),
            rake_log_dir: local
                .rake_log_dir
                .as_ref()
                .or(global.rake_log_dir.as_ref())
                .map(resolve_path),
            interpreter: local
                .interpreter
                .clone()
                .or_else(|| global.interpreter.clone())
                .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string()),
            tasks,
            warnings,
        })
    }
}

impl ResolvedConfig {
    /// Checks the daemon refuses to start without: an existing rake file, an
    /// existing daemon directory and at least one task entry.
    pub fn startup_paths(&self) -> Result<StartupPaths, ConfigError> {
        let rake_file = self
            .rake_file
            .clone()
            .ok_or(ConfigError::MissingField { field: "rake_file" })?;
        if !rake_file.exists() {
            return Err(ConfigError::MissingPath {
                field: "rake_file",
                path: rake_file,
            });
        }

        let daemon_dir = self
            .daemon_dir
            .clone()
            .ok_or(ConfigError::MissingField { field: "daemon_dir" })?;
        if !daemon_dir.exists() {
            return Err(ConfigError::MissingPath {
                field: "daemon_dir",
                path: daemon_dir,
            });
        }
        if !daemon_dir.is_dir() {
            return Err(ConfigError::NotADirectory { path: daemon_dir });
        }

        if self.tasks.is_empty() {
            return Err(ConfigError::MissingField { field: "rakes" });
        }

        Ok(StartupPaths {
            rake_file,
            daemon_dir,
        })
    }

    /// Where a task's output goes: its own `log`, else `<rake_log_dir>/<name>.log`
    /// when `rake_logging` is on, else nowhere.
    pub fn task_log_path(&self, name: &str) -> Option<PathBuf> {
        if let Some(log) = self.tasks.get(name).and_then(|spec| spec.log.clone()) {
            return Some(log);
        }
        if !self.rake_logging {
            return None;
        }
        let dir = self
            .rake_log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/"));
        Some(dir.join(format!("{name}.log")))
    }

    pub fn qty_for(&self, name: &str) -> u32 {
        self.tasks.get(name).map(|spec| spec.qty).unwrap_or(DEFAULT_QTY)
    }
}

/// Make `path` absolute relative to `base`, folding `.` and `..` lexically.
pub fn absolutize(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
