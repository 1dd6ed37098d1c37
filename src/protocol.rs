//! Wire protocol: one UTF-8 command per line, space-separated fields
//!
//! ```text
//! PUSH <value>
//! PULL <fromSlot>
//! STATUS
//! PREPARE <n>
//! ACCEPT <n> <id> <value>
//! SET <n> <id> <value>
//! ```
//!
//! Replies are single lines (`OK`, `REFUSE [n]`, `PROMISE [n id v]`,
//! `ACCEPTED`, `ERR <msg>`) except for `PULL`, which streams one value per
//! line. A request
//! line may carry a `;key=value;...` metadata suffix; it is transport-level
//! annotation only and is stripped before command parsing.

use std::collections::HashMap;
use std::fmt;

use crate::core::acceptor::AcceptedValue;

/// Metadata key under which clients send a display name for logging
pub const META_NAME: &str = "name";

/// Errors produced while parsing wire input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Command word is not part of the protocol
    UnknownCommand,
    /// Command is recognized but its arguments are missing or malformed
    IncorrectCommand,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownCommand => write!(f, "unknown command"),
            ProtocolError::IncorrectCommand => write!(f, "incorrect command"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// A parsed wire command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Append a value to the log via consensus
    Push { value: String },
    /// Tail the log starting at `from`, streaming values indefinitely
    Pull { from: u64 },
    /// Liveness probe
    Status,
    /// Paxos phase one: ask for a promise on proposal number `n`
    Prepare { n: u64 },
    /// Paxos phase two: ask to accept `value` under `n`
    Accept { n: u64, id: String, value: String },
    /// Learn a committed value: apply `value` at slot `n`
    Set { n: u64, id: String, value: String },
}

impl Command {
    /// Parse a raw request line, stripping any `;key=value` metadata suffix.
    pub fn parse_line(line: &str) -> Result<(Command, HashMap<String, String>), ProtocolError> {
        let (text, meta) = split_meta(line)?;
        let command = Command::parse(text.trim())?;
        Ok((command, meta))
    }

    /// Parse a command with metadata already stripped.
    pub fn parse(text: &str) -> Result<Command, ProtocolError> {
        let mut parts = text.splitn(2, ' ');
        let word = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();

        match word {
            "PUSH" => {
                if rest.is_empty() {
                    return Err(ProtocolError::IncorrectCommand);
                }
                Ok(Command::Push { value: rest.to_owned() })
            }
            "PULL" => Ok(Command::Pull { from: parse_int(rest)? }),
            "STATUS" => Ok(Command::Status),
            "PREPARE" => Ok(Command::Prepare { n: parse_int(rest)? }),
            "ACCEPT" => {
                let (n, id, value) = parse_n_id_value(rest)?;
                Ok(Command::Accept { n, id, value })
            }
            "SET" => {
                let (n, id, value) = parse_n_id_value(rest)?;
                Ok(Command::Set { n, id, value })
            }
            _ => Err(ProtocolError::UnknownCommand),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Push { value } => write!(f, "PUSH {}", value),
            Command::Pull { from } => write!(f, "PULL {}", from),
            Command::Status => write!(f, "STATUS"),
            Command::Prepare { n } => write!(f, "PREPARE {}", n),
            Command::Accept { n, id, value } => write!(f, "ACCEPT {} {} {}", n, id, value),
            Command::Set { n, id, value } => write!(f, "SET {} {} {}", n, id, value),
        }
    }
}

/// A single-line reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    /// Refusal; a refused `PREPARE` reports the acceptor's promised number
    Refuse(Option<u64>),
    /// Promise granted, optionally carrying the previously-accepted value
    Promise(Option<AcceptedValue>),
    Accepted,
    /// A streamed `PULL` result line
    Value(String),
    /// Error reply with human-readable text
    Err(String),
}

impl Reply {
    /// Parse a one-line reply (not used for streamed `PULL` values, which are
    /// raw lines).
    pub fn parse(line: &str) -> Result<Reply, ProtocolError> {
        let text = line.trim();
        let mut parts = text.splitn(2, ' ');
        let word = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();

        match word {
            "OK" => Ok(Reply::Ok),
            "REFUSE" => {
                if rest.is_empty() {
                    return Ok(Reply::Refuse(None));
                }
                Ok(Reply::Refuse(Some(parse_int(rest)?)))
            }
            "ACCEPTED" => Ok(Reply::Accepted),
            "ERR" => Ok(Reply::Err(rest.to_owned())),
            "PROMISE" => {
                if rest.is_empty() {
                    return Ok(Reply::Promise(None));
                }
                let (n, id, value) = parse_n_id_value(rest)?;
                Ok(Reply::Promise(Some(AcceptedValue { n, id, value })))
            }
            _ => Err(ProtocolError::UnknownCommand),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => write!(f, "OK"),
            Reply::Refuse(None) => write!(f, "REFUSE"),
            Reply::Refuse(Some(promised)) => write!(f, "REFUSE {}", promised),
            Reply::Promise(None) => write!(f, "PROMISE"),
            Reply::Promise(Some(previous)) => {
                write!(f, "PROMISE {} {} {}", previous.n, previous.id, previous.value)
            }
            Reply::Accepted => write!(f, "ACCEPTED"),
            Reply::Value(value) => write!(f, "{}", value),
            Reply::Err(message) => write!(f, "ERR {}", message),
        }
    }
}

/// Split a raw line into command text and `;key=value` metadata.
fn split_meta(line: &str) -> Result<(&str, HashMap<String, String>), ProtocolError> {
    let mut parts = line.split(';');
    let text = parts.next().unwrap_or("");
    let mut meta = HashMap::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').ok_or(ProtocolError::IncorrectCommand)?;
        meta.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok((text, meta))
}

fn parse_int(text: &str) -> Result<u64, ProtocolError> {
    text.parse().map_err(|_| ProtocolError::IncorrectCommand)
}

/// Parse `<n> <id> <value>` where the value is the tail of the line and may
/// contain spaces.
fn parse_n_id_value(rest: &str) -> Result<(u64, String, String), ProtocolError> {
    let mut parts = rest.splitn(3, ' ');
    let n = parse_int(parts.next().unwrap_or(""))?;
    let id = parts.next().filter(|s| !s.is_empty()).ok_or(ProtocolError::IncorrectCommand)?;
    let value = parts.next().filter(|s| !s.is_empty()).ok_or(ProtocolError::IncorrectCommand)?;
    Ok((n, id.to_owned(), value.to_owned()))
}
