use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, info};

use super::pty::PtyHandle;
use super::{TerminalId, TerminalInfo, TerminalSession};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct NewTerminal {
    pub id: TerminalId,
    pub name: Option<String>,
    pub cwd: PathBuf,
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub activate: bool,
}

/// Owns every live terminal session and keeps the slot numbering and the
/// single-active-terminal rule intact.
pub struct TerminalRegistry {
    sessions: HashMap<TerminalId, TerminalSession>,
    max_terminals: usize,
    min_terminals: usize,
}

impl TerminalRegistry {
    pub fn new(min_terminals: usize, max_terminals: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_terminals: max_terminals.max(1),
            min_terminals: min_terminals.min(max_terminals),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn can_create(&self) -> bool {
        self.sessions.len() < self.max_terminals
    }

    pub fn max_terminals(&self) -> usize {
        self.max_terminals
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&TerminalSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut TerminalSession> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| Error::TerminalNotFound(id.to_string()))
    }

    /// Sessions ordered by slot number.
    pub fn list(&self) -> Vec<&TerminalSession> {
        let mut sessions: Vec<_> = self.sessions.values().collect();
        sessions.sort_by_key(|session| session.number);
        sessions
    }

    pub fn infos(&self) -> Vec<TerminalInfo> {
        self.list().into_iter().map(TerminalInfo::from).collect()
    }

    pub fn active_id(&self) -> Option<TerminalId> {
        self.sessions
            .values()
            .find(|session| session.is_active)
            .map(|session| session.id.clone())
    }

    /// Lowest slot in `1..=max` not held by a live session.
    pub fn next_number(&self) -> Option<usize> {
        (1..=self.max_terminals).find(|n| !self.sessions.values().any(|s| s.number == *n))
    }

    pub fn create(&mut self, request: NewTerminal, pty: Box<dyn PtyHandle>) -> Result<TerminalInfo> {
        let mut pty = pty;
        if self.sessions.contains_key(&request.id) {
            pty.kill();
            return Err(Error::Orchestration(format!(
                "terminal id already registered: {}",
                request.id
            )));
        }
        let Some(number) = self.next_number() else {
            pty.kill();
            return Err(Error::TerminalLimit {
                max: self.max_terminals,
            });
        };

        let activate = request.activate || self.sessions.is_empty();
        if activate {
            for session in self.sessions.values_mut() {
                session.is_active = false;
            }
        }

        let session = TerminalSession {
            id: request.id.clone(),
            name: request.name.unwrap_or_else(|| format!("Terminal {number}")),
            number,
            cwd: request.cwd,
            is_active: activate,
            shell: request.shell,
            cols: request.cols,
            rows: request.rows,
            created_at: Utc::now(),
            pty,
        };
        let info = TerminalInfo::from(&session);
        info!(terminal_id = %info.id, number, active = activate, "terminal registered");
        self.sessions.insert(request.id, session);
        Ok(info)
    }

    /// Remove a session and return it so the caller can release its PTY.
    /// Without `force`, refuses to go below the configured minimum.
    pub fn remove(&mut self, id: &str, force: bool) -> Result<TerminalSession> {
        if !self.sessions.contains_key(id) {
            return Err(Error::TerminalNotFound(id.to_string()));
        }
        if !force && self.sessions.len() <= self.min_terminals {
            return Err(Error::MinimumTerminals {
                min: self.min_terminals,
            });
        }

        let session = self
            .sessions
            .remove(id)
            .ok_or_else(|| Error::TerminalNotFound(id.to_string()))?;

        if session.is_active {
            if let Some(next) = self.sessions.values_mut().min_by_key(|s| s.number) {
                next.is_active = true;
                debug!(terminal_id = %next.id, "activated after removal of active terminal");
            }
        }
        info!(terminal_id = %id, remaining = self.sessions.len(), "terminal unregistered");
        Ok(session)
    }

    pub fn set_active(&mut self, id: &str) -> Result<()> {
        if !self.sessions.contains_key(id) {
            return Err(Error::TerminalNotFound(id.to_string()));
        }
        for session in self.sessions.values_mut() {
            session.is_active = session.id.as_str() == id;
        }
        Ok(())
    }

    pub fn write(&mut self, id: &str, data: &[u8]) -> Result<()> {
        self.get_mut(id)?.pty_mut().write(data)
    }

    pub fn resize(&mut self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let session = self.get_mut(id)?;
        session.pty_mut().resize(cols, rows)?;
        session.cols = cols;
        session.rows = rows;
        Ok(())
    }

    /// Kill every PTY and empty the registry.
    pub fn drain(&mut self) -> Vec<TerminalId> {
        let mut ids = Vec::with_capacity(self.sessions.len());
        for (id, session) in self.sessions.drain() {
            session.into_pty().kill();
            ids.push(id);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakePty;

    fn request(id: &str) -> NewTerminal {
        NewTerminal {
            id: TerminalId::new(id),
            name: None,
            cwd: PathBuf::from("/tmp"),
            shell: Some("bash".into()),
            cols: 80,
            rows: 24,
            activate: true,
        }
    }

    fn registry_with(ids: &[&str]) -> TerminalRegistry {
        let mut registry = TerminalRegistry::new(1, 3);
        for id in ids {
            registry.create(request(id), FakePty::boxed()).unwrap();
        }
        registry
    }

    #[test]
    fn create_assigns_lowest_free_slot_and_single_active() {
        let mut registry = registry_with(&["a", "b"]);
        registry.remove("a", false).unwrap();
        let info = registry.create(request("c"), FakePty::boxed()).unwrap();

        assert_eq!(info.terminal_number, 1);
        assert_eq!(info.name, "Terminal 1");
        assert_eq!(registry.active_id(), Some(TerminalId::new("c")));
        assert_eq!(registry.list().iter().filter(|s| s.is_active).count(), 1);
    }

    #[test]
    fn create_rejects_beyond_max() {
        let mut registry = registry_with(&["a", "b", "c"]);
        let err = registry.create(request("d"), FakePty::boxed()).unwrap_err();
        assert!(matches!(err, Error::TerminalLimit { max: 3 }));
    }

    #[test]
    fn remove_respects_minimum_unless_forced() {
        let mut registry = registry_with(&["a"]);
        assert!(matches!(
            registry.remove("a", false),
            Err(Error::MinimumTerminals { min: 1 })
        ));
        assert!(registry.remove("a", true).is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_active_promotes_lowest_numbered() {
        let mut registry = registry_with(&["a", "b", "c"]);
        registry.set_active("b").unwrap();
        registry.remove("b", false).unwrap();
        assert_eq!(registry.active_id(), Some(TerminalId::new("a")));
    }

    #[test]
    fn resize_updates_session_dimensions() {
        let mut registry = registry_with(&["a"]);
        registry.resize("a", 120, 40).unwrap();
        let session = registry.get("a").unwrap();
        assert_eq!((session.cols, session.rows), (120, 40));
    }
}
