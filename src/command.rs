//! Key-value wire protocol: command lines and response lines.
//!
//! Commands are single whitespace-separated lines:
//! - `SET <key> <value>` answered with `1`
//! - `GET <key>` answered with the value, or `None` when absent
//! - `DEL <key>` answered with `1` if the key existed, `0` otherwise
//!
//! Malformed lines are answered by the server with a one-line diagnostic.
//! The client side never interprets those; it only builds well-formed
//! commands and trims response lines before comparing them.

use std::fmt;

/// Response to a successful SET
pub const STORED: &str = "1";

/// Response to GET for an absent key
pub const MISSING: &str = "None";

/// A parsed key-value command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a value under a key
    Set { key: String, value: String },

    /// Fetch the value of a key
    Get { key: String },

    /// Remove a key
    Del { key: String },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Command::Get { key: key.into() }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Command::Del { key: key.into() }
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Set { .. } => "SET",
            Command::Get { .. } => "GET",
            Command::Del { .. } => "DEL",
        }
    }

    /// Parse one command line (without its newline terminator).
    ///
    /// Carriage returns and surrounding whitespace are ignored. Command
    /// names are case-sensitive.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&name) = parts.first() else {
            return Err(ParseError::Empty);
        };

        let expected = match name {
            "SET" => 3,
            "GET" | "DEL" => 2,
            _ => return Err(ParseError::UnknownCommand(name.to_string())),
        };
        if parts.len() != expected {
            return Err(ParseError::WrongArity {
                command: name.to_string(),
                count: parts.len(),
            });
        }

        Ok(match name {
            "SET" => Command::set(parts[1], parts[2]),
            "GET" => Command::get(parts[1]),
            _ => Command::del(parts[1]),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Set { key, value } => write!(f, "SET {} {}", key, value),
            Command::Get { key } => write!(f, "GET {}", key),
            Command::Del { key } => write!(f, "DEL {}", key),
        }
    }
}

/// Command parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Blank line
    Empty,
    /// First word is not SET, GET or DEL
    UnknownCommand(String),
    /// Known command with the wrong number of words (command included)
    WrongArity { command: String, count: usize },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "Invalid command ``"),
            ParseError::UnknownCommand(name) => write!(f, "Invalid command `{}`", name),
            ParseError::WrongArity { command, count } => write!(
                f,
                "Wrong number of parameters ({}) for command `{}`",
                count, command
            ),
        }
    }
}

impl std::error::Error for ParseError {}

/// Response line builders
pub struct Response;

impl Response {
    /// Value returned by GET
    pub fn value(value: Option<&str>) -> String {
        format!("{}\n", value.unwrap_or(MISSING))
    }

    /// Acknowledgement of SET
    pub fn stored() -> &'static str {
        "1\n"
    }

    /// Result of DEL
    pub fn deleted(existed: bool) -> &'static str {
        if existed {
            "1\n"
        } else {
            "0\n"
        }
    }

    /// Diagnostic for a line that did not parse
    pub fn error(err: &ParseError) -> String {
        format!("{}\n", err)
    }

    /// Sent before dropping a session whose unterminated line grew too long
    pub fn line_too_long(limit: usize) -> String {
        format!("Line too long (max {} bytes)\n", limit)
    }
}

/// Trim a response line for comparison.
///
/// Servers may leave a carriage return or trailing spaces on a line.
pub fn normalize(line: &str) -> &str {
    line.trim()
}
