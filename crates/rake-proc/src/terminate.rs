//! Escalating termination: SIGTERM, a grace period, then SIGKILL.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::thread;
use std::time::Duration;

use crate::error::ProcError;

/// Time a process gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// What happened to a pid handed to a terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The pid did not exist when SIGTERM was sent.
    AlreadyGone,
    /// The process exited within the grace period.
    Exited,
    /// The process outlived the grace period and was sent SIGKILL.
    Killed,
}

pub trait Terminate: Send + Sync {
    /// Stop one pid. A pid that does not exist is a successful outcome,
    /// never an error.
    fn terminate(&self, pid: u32) -> Result<Termination, ProcError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalTerminator {
    grace: Duration,
}

impl Default for SignalTerminator {
    fn default() -> Self {
        Self {
            grace: TERMINATE_GRACE,
        }
    }
}

impl SignalTerminator {
    pub fn with_grace(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }
}

impl Terminate for SignalTerminator {
    fn terminate(&self, pid: u32) -> Result<Termination, ProcError> {
        let Some(target) = to_pid(pid) else {
            return Ok(Termination::AlreadyGone);
        };

        match kill(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(Termination::AlreadyGone),
            Err(source) => {
                return Err(ProcError::Signal {
                    pid,
                    signal: "SIGTERM",
                    source,
                })
            }
        }

        thread::sleep(self.grace);

        if !is_alive(pid) {
            return Ok(Termination::Exited);
        }
        match kill(target, Signal::SIGKILL) {
            Ok(()) => Ok(Termination::Killed),
            Err(Errno::ESRCH) => Ok(Termination::Exited),
            Err(source) => Err(ProcError::Signal {
                pid,
                signal: "SIGKILL",
                source,
            }),
        }
    }
}

/// Signal-0 probe. A pid we may not signal still exists.
pub fn is_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

// pid 0 and anything above i32::MAX would address process groups.
fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}
