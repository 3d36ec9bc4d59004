//! Command observer: a thread that reads control messages off the channel
//! and applies them to the shared state.

use rake_core::CommandMessage;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::channel::{ChannelError, CommandChannel};
use crate::daemon_log::DaemonLog;
use crate::runtime::TaskRuntime;
use crate::state::{SharedState, SupervisionState};

/// Pause between channel reads.
pub const COMMAND_CHECK_WAIT: Duration = Duration::from_millis(250);
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Continue,
    Stop,
}

/// Apply one message. The caller holds the state lock for the duration.
///
/// Only `log` records the command; process helpers get a disabled log so a
/// command shows up as a single line.
pub fn apply_command(
    message: &CommandMessage,
    state: &mut SupervisionState,
    runtime: &TaskRuntime,
    log: &DaemonLog,
) -> CommandOutcome {
    let quiet = DaemonLog::disabled();
    match message {
        CommandMessage::StopRake(task) => {
            state.ignored.insert(task.clone());
            if let Err(err) = runtime.stop_task(task, &quiet) {
                log.error(&format!("failed to stop {task}: {err}"));
            }
            state.started.remove(task);
        }
        CommandMessage::StartRake(task) => {
            if state.shutting_down {
                log.warn(&format!("not starting {task}: shutting down"));
                return CommandOutcome::Continue;
            }
            let qty = state.config().qty_for(task);
            state.started.insert(task.clone());
            if let Err(err) = runtime.launch_instances(state.config(), task, qty, &quiet) {
                log.error(&format!("failed to start {task}: {err}"));
            }
            state.ignored.remove(task);
        }
        CommandMessage::ClearIgnores => state.ignored.clear(),
        CommandMessage::Shutdown => {
            log.info("stopping command observer");
            return CommandOutcome::Stop;
        }
        CommandMessage::Unknown(line) => log.warn(&format!("invalid command '{line}'")),
    }
    CommandOutcome::Continue
}

pub struct CommandObserver {
    channel: CommandChannel,
    state: SharedState,
    runtime: Arc<TaskRuntime>,
    log: DaemonLog,
    running: Arc<AtomicBool>,
    poll: Duration,
    receive_timeout: Duration,
}

impl CommandObserver {
    pub fn new(
        channel: CommandChannel,
        state: SharedState,
        runtime: Arc<TaskRuntime>,
        log: DaemonLog,
    ) -> Self {
        Self {
            channel,
            state,
            runtime,
            log,
            running: Arc::new(AtomicBool::new(false)),
            poll: COMMAND_CHECK_WAIT,
            receive_timeout: RECEIVE_TIMEOUT,
        }
    }

    pub fn with_timing(mut self, poll: Duration, receive_timeout: Duration) -> Self {
        self.poll = poll;
        self.receive_timeout = receive_timeout;
        self
    }

    /// Start the observer thread. The running flag is raised before the
    /// thread exists so a shutdown racing the spawn still waits for it.
    pub fn spawn(self) -> io::Result<ObserverHandle> {
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);
        let thread = thread::Builder::new()
            .name("command-observer".to_string())
            .spawn(move || self.run());
        match thread {
            Ok(thread) => Ok(ObserverHandle { running, thread }),
            Err(err) => {
                running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn run(mut self) {
        self.log.info(&format!(
            "starting command observer on {}",
            self.channel.path().display()
        ));
        loop {
            thread::sleep(self.poll);
            match self.channel.receive(self.receive_timeout) {
                Ok(Some(message)) => {
                    self.log.info(&format!("received command: {message}"));
                    let outcome = {
                        let mut state = self.state.lock();
                        apply_command(&message, &mut state, &self.runtime, &self.log)
                    };
                    if outcome == CommandOutcome::Stop {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    self.log.error(&err.to_string());
                    if matches!(err, ChannelError::Open { .. }) {
                        if let Err(err) = self.channel.create() {
                            self.log.error(&err.to_string());
                        }
                    }
                }
            }
            if self.state.is_shutting_down() {
                self.log.info("shutdown in progress; stopping command observer");
                break;
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

pub struct ObserverHandle {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ObserverHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}
