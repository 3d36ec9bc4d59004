//! Operator commands, dispatched through an explicit registry.

use nix::errno::Errno;
use nix::unistd::gethostname;
use rake_core::{
    expand_config_path, find_config, is_valid_task_name, CommandMessage, ConfigError, ConfigIndex,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::channel::{ChannelError, CommandChannel};
use crate::daemon_log::DaemonLog;
use crate::daemon_loop::{install_panic_logging, ConfigSource, FileConfigSource};
use crate::lifecycle::{
    daemon_status, stop_daemon, DaemonLifecycle, DaemonPaths, DaemonStatus, LifecycleError,
    StartOptions, StopOutcome,
};
use crate::runner::{prepare, RakeRunner, RunnerError};

/// Pause between the stop and start halves of `restart`.
pub const RESTART_PAUSE: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("invalid command{}. Please specify {available}.", quoted(.given))]
    UnknownCommand {
        given: Option<String>,
        available: String,
    },
    #[error("usage: {usage}")]
    MissingArgument { usage: &'static str },
    #[error("invalid rake name {name:?}: must be a single token without whitespace")]
    InvalidTaskName { name: String },
    #[error("failed to read hostname: {source}")]
    Hostname {
        #[source]
        source: Errno,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

fn quoted(given: &Option<String>) -> String {
    given
        .as_ref()
        .map(|command| format!(" '{command}'"))
        .unwrap_or_default()
}

impl ControlError {
    /// 2 for command-line misuse, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            ControlError::UnknownCommand { .. }
            | ControlError::MissingArgument { .. }
            | ControlError::InvalidTaskName { .. } => 2,
            _ => 1,
        }
    }
}

/// Global options shared by every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliContext {
    pub conf_file: Option<PathBuf>,
    pub name: String,
    pub foreground: bool,
    pub debug: bool,
}

pub type Handler = fn(&CliContext, &[String]) -> Result<(), ControlError>;

pub struct CommandSpec {
    pub name: &'static str,
    pub usage: &'static str,
    pub handler: Handler,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "start",
        usage: "rakerunner start",
        handler: cmd_start,
    },
    CommandSpec {
        name: "stop",
        usage: "rakerunner stop",
        handler: cmd_stop,
    },
    CommandSpec {
        name: "restart",
        usage: "rakerunner restart",
        handler: cmd_restart,
    },
    CommandSpec {
        name: "status",
        usage: "rakerunner status",
        handler: cmd_status,
    },
    CommandSpec {
        name: "startrake",
        usage: "rakerunner startrake <rake>...",
        handler: cmd_startrake,
    },
    CommandSpec {
        name: "stoprake",
        usage: "rakerunner stoprake <rake>...",
        handler: cmd_stoprake,
    },
    CommandSpec {
        name: "clearignores",
        usage: "rakerunner clearignores",
        handler: cmd_clearignores,
    },
    CommandSpec {
        name: "hosts",
        usage: "rakerunner hosts [rake]",
        handler: cmd_hosts,
    },
];

pub fn available_commands() -> Vec<&'static str> {
    COMMANDS.iter().map(|spec| spec.name).collect()
}

pub fn find_command(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.name == name)
}

pub fn dispatch(
    ctx: &CliContext,
    command: Option<&str>,
    args: &[String],
) -> Result<(), ControlError> {
    match command.and_then(find_command) {
        Some(spec) => (spec.handler)(ctx, args),
        None => Err(ControlError::UnknownCommand {
            given: command.map(str::to_string),
            available: available_commands().join(", "),
        }),
    }
}

fn hostname() -> Result<String, ControlError> {
    gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .map_err(|source| ControlError::Hostname { source })
}

fn conf_file(ctx: &CliContext) -> Result<PathBuf, ControlError> {
    match &ctx.conf_file {
        Some(path) => Ok(expand_config_path(path)?),
        None => Ok(find_config()?),
    }
}

/// Daemon file locations for operator commands; these only need
/// `daemon_dir`, not a complete startup configuration.
fn daemon_paths(ctx: &CliContext) -> Result<DaemonPaths, ControlError> {
    let config = FileConfigSource::new(conf_file(ctx)?, hostname()?).load()?;
    let dir = config
        .daemon_dir
        .ok_or(ConfigError::MissingField { field: "daemon_dir" })?;
    Ok(DaemonPaths::new(dir, ctx.name.clone()))
}

fn cmd_start(ctx: &CliContext, _args: &[String]) -> Result<(), ControlError> {
    let setup = prepare(conf_file(ctx)?, &hostname()?, &ctx.name)?;
    let debug = ctx.debug || setup.config.debug;
    let paths = setup.paths.clone();
    eprintln!("starting daemon");

    let log = DaemonLog::open_or_stderr(paths.log_file(), debug);
    install_panic_logging(log.clone());
    let runner = Arc::new(RakeRunner::system(setup, log.clone()));
    let options = StartOptions {
        detach: !ctx.foreground,
        debug,
        handle_signals: true,
    };
    DaemonLifecycle::new(paths).start(runner, options, &log)?;
    Ok(())
}

fn cmd_stop(ctx: &CliContext, _args: &[String]) -> Result<(), ControlError> {
    let paths = daemon_paths(ctx)?;
    eprintln!("stopping daemon");
    match stop_daemon(&paths)? {
        StopOutcome::Signalled(_) => {}
        StopOutcome::NotRunning => eprintln!("pid file not found. Is the daemon started?"),
        StopOutcome::NoProcess(pid) => eprintln!("no process running on pid {pid}"),
    }
    Ok(())
}

fn cmd_restart(ctx: &CliContext, args: &[String]) -> Result<(), ControlError> {
    cmd_stop(ctx, args)?;
    thread::sleep(RESTART_PAUSE);
    cmd_start(ctx, args)
}

fn cmd_status(ctx: &CliContext, _args: &[String]) -> Result<(), ControlError> {
    let paths = daemon_paths(ctx)?;
    match daemon_status(&paths)? {
        DaemonStatus::Running(pid) => eprintln!("daemon running on pid {pid}"),
        DaemonStatus::Stale(pid) => eprintln!("no process running on pid {pid}"),
        DaemonStatus::NotRunning => eprintln!("daemon not running"),
    }
    Ok(())
}

fn task_names<'a>(args: &'a [String], usage: &'static str) -> Result<&'a [String], ControlError> {
    if args.is_empty() {
        return Err(ControlError::MissingArgument { usage });
    }
    if let Some(bad) = args.iter().find(|name| !is_valid_task_name(name)) {
        return Err(ControlError::InvalidTaskName { name: bad.clone() });
    }
    Ok(args)
}

fn send_all(ctx: &CliContext, messages: &[CommandMessage]) -> Result<(), ControlError> {
    let channel = CommandChannel::new(daemon_paths(ctx)?.fifo_file());
    for message in messages {
        channel.send(message)?;
    }
    Ok(())
}

fn cmd_startrake(ctx: &CliContext, args: &[String]) -> Result<(), ControlError> {
    let names = task_names(args, "rakerunner startrake <rake>...")?;
    let messages: Vec<_> = names
        .iter()
        .map(|name| CommandMessage::StartRake(name.clone()))
        .collect();
    send_all(ctx, &messages)
}

fn cmd_stoprake(ctx: &CliContext, args: &[String]) -> Result<(), ControlError> {
    let names = task_names(args, "rakerunner stoprake <rake>...")?;
    let messages: Vec<_> = names
        .iter()
        .map(|name| CommandMessage::StopRake(name.clone()))
        .collect();
    send_all(ctx, &messages)
}

fn cmd_clearignores(ctx: &CliContext, _args: &[String]) -> Result<(), ControlError> {
    send_all(ctx, &[CommandMessage::ClearIgnores])
}

/// Without arguments: every host with its rakes. With a rake name: the
/// hosts that run it.
fn cmd_hosts(ctx: &CliContext, args: &[String]) -> Result<(), ControlError> {
    let mut index = ConfigIndex::new(conf_file(ctx)?);
    for line in hosts_report(&mut index, args.first().map(String::as_str))? {
        println!("{line}");
    }
    Ok(())
}

fn hosts_report(index: &mut ConfigIndex, task: Option<&str>) -> Result<Vec<String>, ConfigError> {
    match task {
        Some(task) => Ok(index
            .tasks_hosts()?
            .get(task)
            .cloned()
            .unwrap_or_default()),
        None => Ok(index
            .hosts_tasks()?
            .iter()
            .map(|(host, tasks)| format!("{host}: {}", tasks.join(", ")))
            .collect()),
    }
}
