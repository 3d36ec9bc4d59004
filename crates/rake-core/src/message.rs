//! Control messages carried over the command channel.

use std::fmt;

/// One line of the control protocol.
///
/// Parsing never fails: anything that is not a recognized command becomes
/// `Unknown` so the observer can log it and move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandMessage {
    StartRake(String),
    StopRake(String),
    ClearIgnores,
    Shutdown,
    Unknown(String),
}

impl CommandMessage {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("startrake ") {
            return named(name, CommandMessage::StartRake, line);
        }
        if let Some(name) = line.strip_prefix("stoprake ") {
            return named(name, CommandMessage::StopRake, line);
        }
        match line {
            "clearignores" => CommandMessage::ClearIgnores,
            "shutdown" => CommandMessage::Shutdown,
            other => CommandMessage::Unknown(other.to_string()),
        }
    }
}

fn named(name: &str, build: fn(String) -> CommandMessage, line: &str) -> CommandMessage {
    let name = name.trim();
    if name.is_empty() {
        CommandMessage::Unknown(line.to_string())
    } else {
        build(name.to_string())
    }
}

impl fmt::Display for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandMessage::StartRake(name) => write!(f, "startrake {name}"),
            CommandMessage::StopRake(name) => write!(f, "stoprake {name}"),
            CommandMessage::ClearIgnores => f.write_str("clearignores"),
            CommandMessage::Shutdown => f.write_str("shutdown"),
            CommandMessage::Unknown(line) => f.write_str(line),
        }
    }
}
