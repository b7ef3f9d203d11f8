use std::borrow::Borrow;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pty::PtyHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalId(String);

impl TerminalId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh host-assigned identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TerminalId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Deref for TerminalId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl From<String> for TerminalId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TerminalId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A live terminal. The session exclusively owns its PTY; removing the
/// session from the registry hands the PTY back to the caller to kill.
pub struct TerminalSession {
    pub id: TerminalId,
    pub name: String,
    pub number: usize,
    pub cwd: PathBuf,
    pub is_active: bool,
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
    pub(crate) pty: Box<dyn PtyHandle>,
}

impl TerminalSession {
    pub fn pty_mut(&mut self) -> &mut dyn PtyHandle {
        self.pty.as_mut()
    }

    pub fn into_pty(self) -> Box<dyn PtyHandle> {
        self.pty
    }
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("number", &self.number)
            .field("cwd", &self.cwd)
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a session, as announced to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub id: TerminalId,
    pub name: String,
    pub cwd: String,
    pub is_active: bool,
    pub terminal_number: usize,
}

impl From<&TerminalSession> for TerminalInfo {
    fn from(session: &TerminalSession) -> Self {
        Self {
            id: session.id.clone(),
            name: session.name.clone(),
            cwd: session.cwd.to_string_lossy().to_string(),
            is_active: session.is_active,
            terminal_number: session.number,
        }
    }
}

/// Bounded ring of recent output lines, kept for session snapshots.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    lines: VecDeque<String>,
    partial: String,
    capacity: usize,
}

impl ScrollbackBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            partial: String::new(),
            capacity,
        }
    }

    pub fn append(&mut self, data: &str) {
        let mut rest = data;
        while let Some(pos) = rest.find('\n') {
            self.partial.push_str(rest[..pos].trim_end_matches('\r'));
            let line = std::mem::take(&mut self.partial);
            self.push_line(line);
            rest = &rest[pos + 1..];
        }
        self.partial.push_str(rest);
    }

    pub fn restore(&mut self, lines: Vec<String>) {
        self.lines.clear();
        self.partial.clear();
        for line in lines {
            self.push_line(line);
        }
    }

    /// Complete lines followed by the unterminated tail, if any.
    pub fn snapshot(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.lines.iter().cloned().collect();
        if !self.partial.is_empty() {
            lines.push(self.partial.clone());
        }
        lines
    }

    fn push_line(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}
