//! Host/task cross reference over a config file, used for reporting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{load_config_file, ConfigError, ConfigFile};

/// Cached view of which tasks each host runs and which hosts run each task.
///
/// Nothing is read until the first query or an explicit `reload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIndex {
    path: PathBuf,
    loaded: bool,
    hosts_tasks: BTreeMap<String, Vec<String>>,
    tasks_hosts: BTreeMap<String, Vec<String>>,
}

impl ConfigIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: false,
            hosts_tasks: BTreeMap::new(),
            tasks_hosts: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Re-read the config file, replacing any cached view.
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        let config = load_config_file(&self.path)?;
        self.rebuild(&config);
        Ok(())
    }

    pub fn hosts_tasks(&mut self) -> Result<&BTreeMap<String, Vec<String>>, ConfigError> {
        self.ensure_loaded()?;
        Ok(&self.hosts_tasks)
    }

    pub fn tasks_hosts(&mut self) -> Result<&BTreeMap<String, Vec<String>>, ConfigError> {
        self.ensure_loaded()?;
        Ok(&self.tasks_hosts)
    }

    fn ensure_loaded(&mut self) -> Result<(), ConfigError> {
        if !self.loaded {
            self.reload()?;
        }
        Ok(())
    }

    fn rebuild(&mut self, config: &ConfigFile) {
        self.hosts_tasks.clear();
        self.tasks_hosts.clear();
        for (host, cfg) in &config.hosts {
            let mut tasks: Vec<String> = cfg
                .rakes
                .iter()
                .flatten()
                .filter_map(|entry| entry.rake.clone())
                .collect();
            tasks.sort();
            tasks.dedup();
            for task in &tasks {
                self.tasks_hosts
                    .entry(task.clone())
                    .or_default()
                    .push(host.clone());
            }
            self.hosts_tasks.insert(host.clone(), tasks);
        }
        self.loaded = true;
    }
}
