#![forbid(unsafe_code)]

// STOMP text-frame codec for the command subset the chat service speaks.
// A frame on the wire is `COMMAND\nheader:value\n...\n\n[BODY]\0`.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("malformed header line: {0}")]
    BadHeader(String),
}

/// STOMP command token. Commands outside the subset the harness uses are
/// preserved as `Other` so the session can ignore them without failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Send,
    Message,
    Other(String),
}

impl Command {
    fn from_token(token: &str) -> Self {
        match token {
            "CONNECT" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            other => Command::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Other(token) => token,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame. Header order is preserved so encoding and parsing
/// round-trip exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serializes the frame to its wire form, NUL-terminated.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parses a frame from its wire form. Tolerates a missing trailing NUL
    /// and `\r\n` line endings (the service terminates lines either way).
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let raw = raw.strip_suffix('\0').unwrap_or(raw);

        let (head, body) = if let Some(split) = raw.split_once("\r\n\r\n") {
            split
        } else if let Some(split) = raw.split_once("\n\n") {
            split
        } else {
            (raw, "")
        };

        let mut lines = head.lines();
        let command = lines
            .next()
            .map(str::trim_end)
            .filter(|token| !token.is_empty())
            .map(Command::from_token)
            .ok_or(FrameError::Empty)?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::BadHeader(line.to_string()))?;
            headers.push((name.to_string(), value.to_string()));
        }

        Ok(Self {
            command,
            headers,
            body: body.to_string(),
        })
    }
}
