//! Groups live processes by the task they are running.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::command::InvocationTemplate;
use crate::error::ProcError;
use crate::table::{ProcEntry, ProcessTable};

/// One running instance of a task: the supervisor's direct child plus that
/// child's immediate children. Deeper descendants are not tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    pub pid: u32,
    pub children: Vec<u32>,
}

impl ProcessGroup {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            children: Vec::new(),
        }
    }

    /// Top-level pid first, then its children.
    pub fn pids(&self) -> Vec<u32> {
        let mut pids = Vec::with_capacity(self.children.len() + 1);
        pids.push(self.pid);
        pids.extend(&self.children);
        pids
    }
}

/// Observed instances keyed by task name.
pub type ObservedGroups = BTreeMap<String, Vec<ProcessGroup>>;

pub struct ProcessRegistry {
    table: Arc<dyn ProcessTable>,
    template: InvocationTemplate,
    /// `None` means whichever process is asking, read at query time so a
    /// registry built before the daemon forks still finds its children.
    supervisor_pid: Option<u32>,
}

impl ProcessRegistry {
    pub fn new(table: Arc<dyn ProcessTable>, template: InvocationTemplate) -> Self {
        Self {
            table,
            template,
            supervisor_pid: None,
        }
    }

    pub fn with_supervisor_pid(
        table: Arc<dyn ProcessTable>,
        template: InvocationTemplate,
        supervisor_pid: u32,
    ) -> Self {
        Self {
            table,
            template,
            supervisor_pid: Some(supervisor_pid),
        }
    }

    pub fn template(&self) -> &InvocationTemplate {
        &self.template
    }

    pub fn supervisor_pid(&self) -> u32 {
        self.supervisor_pid.unwrap_or_else(std::process::id)
    }

    /// Live instances of each named task. Every requested name is present in
    /// the result, with an empty list when nothing is running.
    pub fn groups<S: AsRef<str>>(&self, tasks: &[S]) -> Result<ObservedGroups, ProcError> {
        let entries = self.table.snapshot()?;
        Ok(group_processes(
            &entries,
            &self.template,
            tasks,
            self.supervisor_pid(),
        ))
    }

    pub fn groups_for(&self, task: &str) -> Result<Vec<ProcessGroup>, ProcError> {
        let mut groups = self.groups(&[task])?;
        Ok(groups.remove(task).unwrap_or_default())
    }
}

pub fn group_processes<S: AsRef<str>>(
    entries: &[ProcEntry],
    template: &InvocationTemplate,
    tasks: &[S],
    supervisor_pid: u32,
) -> ObservedGroups {
    let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries {
        children_of.entry(entry.ppid).or_default().push(entry.pid);
    }

    let mut observed = ObservedGroups::new();
    for task in tasks {
        let task = task.as_ref();
        let command = template.for_task(task);
        let mut groups: Vec<ProcessGroup> = entries
            .iter()
            // Instances left behind by another supervisor are not ours.
            .filter(|entry| entry.ppid == supervisor_pid && command.matches(&entry.argv))
            .map(|entry| ProcessGroup {
                pid: entry.pid,
                children: children_of.get(&entry.pid).cloned().unwrap_or_default(),
            })
            .collect();
        groups.sort_by_key(|group| group.pid);
        observed.insert(task.to_string(), groups);
    }
    observed
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPERVISOR: u32 = 100;

    fn template() -> InvocationTemplate {
        InvocationTemplate::new("/usr/bin/rake", "/srv/Rakefile")
    }

    fn entry(pid: u32, ppid: u32, cmd: &str) -> ProcEntry {
        ProcEntry {
            pid,
            ppid,
            argv: cmd.split(' ').map(str::to_string).collect(),
        }
    }

    fn table() -> Vec<ProcEntry> {
        vec![
            entry(1, 0, "/sbin/init"),
            entry(SUPERVISOR, 1, "/usr/bin/rakerunner start"),
            entry(210, SUPERVISOR, "/usr/bin/rake -f /srv/Rakefile jobs:work"),
            entry(205, SUPERVISOR, "/usr/bin/rake -f /srv/Rakefile jobs:work"),
            entry(211, 210, "sh -c convert image.png"),
            entry(212, 211, "convert image.png"),
            entry(220, SUPERVISOR, "/usr/bin/rake -f /srv/Rakefile jobs:work2"),
            entry(230, 1, "/usr/bin/rake -f /srv/Rakefile jobs:work"),
        ]
    }

    #[test]
    fn groups_direct_children_with_one_generation_below() {
        let observed = group_processes(&table(), &template(), &["jobs:work"], SUPERVISOR);
        let groups = &observed["jobs:work"];
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], ProcessGroup::new(205));
        assert_eq!(
            groups[1],
            ProcessGroup {
                pid: 210,
                children: vec![211],
            }
        );
    }

    #[test]
    fn foreign_parents_and_name_prefixes_are_excluded() {
        let observed = group_processes(
            &table(),
            &template(),
            &["jobs:work", "jobs:work2"],
            SUPERVISOR,
        );
        assert!(observed["jobs:work"].iter().all(|group| group.pid != 230));
        assert_eq!(observed["jobs:work2"], vec![ProcessGroup::new(220)]);
    }

    #[test]
    fn tasks_without_instances_map_to_empty_lists() {
        let observed = group_processes(&table(), &template(), &["mail:deliver"], SUPERVISOR);
        assert_eq!(observed.get("mail:deliver"), Some(&Vec::new()));
    }

    #[test]
    fn pids_lists_parent_first() {
        let group = ProcessGroup {
            pid: 10,
            children: vec![11, 12],
        };
        assert_eq!(group.pids(), vec![10, 11, 12]);
    }

    struct StaticTable(Vec<ProcEntry>);

    impl ProcessTable for StaticTable {
        fn snapshot(&self) -> Result<Vec<ProcEntry>, ProcError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn registry_reads_snapshot_through_table() {
        let registry = ProcessRegistry::with_supervisor_pid(
            Arc::new(StaticTable(table())),
            template(),
            SUPERVISOR,
        );
        assert_eq!(registry.supervisor_pid(), SUPERVISOR);
        assert_eq!(registry.groups_for("jobs:work").expect("groups").len(), 2);
        assert!(registry.groups_for("nothing").expect("groups").is_empty());
    }

    #[test]
    fn default_supervisor_is_the_current_process() {
        let registry = ProcessRegistry::new(Arc::new(StaticTable(Vec::new())), template());
        assert_eq!(registry.supervisor_pid(), std::process::id());
    }
}
