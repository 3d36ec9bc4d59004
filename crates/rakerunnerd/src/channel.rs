//! Named-pipe command channel between the CLI and the running daemon.
//!
//! Every message is one `\n`-terminated line. Each send and each receive
//! opens the FIFO afresh and closes it when done.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use rake_core::CommandMessage;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

pub const MESSAGE_TERMINATOR: u8 = b'\n';
/// How long `send` keeps retrying while nobody is reading.
pub const SEND_DEADLINE: Duration = Duration::from_secs(5);
const POLL_STEP: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to create command fifo {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: Errno,
    },
    #[error("{path} exists and is not a fifo")]
    NotAFifo { path: PathBuf },
    #[error("failed to open command fifo {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read command fifo {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write command fifo {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no reader on {path} after {waited:?}; is the daemon running?")]
    NoReader { path: PathBuf, waited: Duration },
    #[error("failed to remove command fifo {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct CommandChannel {
    path: PathBuf,
    send_deadline: Duration,
    /// Complete lines read ahead of the one returned by `receive`.
    pending: VecDeque<String>,
}

impl CommandChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            send_deadline: SEND_DEADLINE,
            pending: VecDeque::new(),
        }
    }

    pub fn with_send_deadline(mut self, deadline: Duration) -> Self {
        self.send_deadline = deadline;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make the FIFO (mode 0600) unless it is already there.
    pub fn create(&self) -> Result<(), ChannelError> {
        match mkfifo(&self.path, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(()) => Ok(()),
            Err(Errno::EEXIST) => {
                let is_fifo = fs::metadata(&self.path)
                    .map(|meta| meta.file_type().is_fifo())
                    .unwrap_or(false);
                if is_fifo {
                    Ok(())
                } else {
                    Err(ChannelError::NotAFifo {
                        path: self.path.clone(),
                    })
                }
            }
            Err(source) => Err(ChannelError::Create {
                path: self.path.clone(),
                source,
            }),
        }
    }

    pub fn remove(&self) -> Result<(), ChannelError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ChannelError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }

    pub fn send(&self, message: &CommandMessage) -> Result<(), ChannelError> {
        let mut payload = message.to_string().into_bytes();
        payload.push(MESSAGE_TERMINATOR);

        let started = Instant::now();
        loop {
            let (step, err) = match self.try_send(&payload) {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };
            if !is_retryable(&err) {
                return Err(step.into_error(self.path.clone(), err));
            }
            if started.elapsed() >= self.send_deadline {
                return Err(ChannelError::NoReader {
                    path: self.path.clone(),
                    waited: self.send_deadline,
                });
            }
            thread::sleep(POLL_STEP);
        }
    }

    fn try_send(&self, payload: &[u8]) -> Result<(), (SendStep, io::Error)> {
        let mut fifo = OpenOptions::new()
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&self.path)
            .map_err(|err| (SendStep::Open, err))?;
        // Lines are far below PIPE_BUF, so the write is atomic.
        fifo.write_all(payload)
            .map_err(|err| (SendStep::Write, err))
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when the timeout passes or the writer goes away
    /// without finishing a line; an unterminated fragment is discarded.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<CommandMessage>, ChannelError> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(Some(CommandMessage::parse(&line)));
        }

        let mut fifo = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&self.path)
            .map_err(|source| ChannelError::Open {
                path: self.path.clone(),
                source,
            })?;

        let deadline = Instant::now() + timeout;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            match fifo.read(&mut chunk) {
                // No writer has connected yet.
                Ok(0) if buf.is_empty() => {}
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    continue;
                }
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(source) => {
                    return Err(ChannelError::Read {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
            if buf.contains(&MESSAGE_TERMINATOR) || Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL_STEP);
        }

        self.pending.extend(complete_lines(&buf));
        Ok(self
            .pending
            .pop_front()
            .map(|line| CommandMessage::parse(&line)))
    }
}

#[derive(Debug, Clone, Copy)]
enum SendStep {
    Open,
    Write,
}

impl SendStep {
    fn into_error(self, path: PathBuf, source: io::Error) -> ChannelError {
        match self {
            SendStep::Open => ChannelError::Open { path, source },
            SendStep::Write => ChannelError::Write { path, source },
        }
    }
}

// ENXIO: nobody has the FIFO open for reading. EPIPE: the reader left
// between our open and write. EAGAIN: the pipe is momentarily full.
fn is_retryable(err: &io::Error) -> bool {
    if err.kind() == ErrorKind::WouldBlock {
        return true;
    }
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENXIO) | Some(Errno::EPIPE)
    )
}

/// Terminated, non-blank lines of `buf`; a trailing fragment is dropped.
fn complete_lines(buf: &[u8]) -> Vec<String> {
    let Some(end) = buf.iter().rposition(|byte| *byte == MESSAGE_TERMINATOR) else {
        return Vec::new();
    };
    buf[..end]
        .split(|byte| *byte == MESSAGE_TERMINATOR)
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}
