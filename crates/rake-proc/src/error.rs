use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    #[error("failed to read process table ({context}): {source}")]
    Table {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid process table output: {context}")]
    Parse { context: String },
    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: &'static str,
        #[source]
        source: nix::errno::Errno,
    },
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open task log {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("program {program} not found on PATH")]
    ProgramNotFound { program: String },
}
