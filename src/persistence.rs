//! Session snapshots
//!
//! A snapshot records every terminal's identity, working directory and
//! recent scrollback so a restarted host can bring the same layout back.
//! Stores only move opaque JSON blobs; validation and error recovery live in
//! [`SessionPersistence`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PersistenceSettings;
use crate::constants::SNAPSHOT_VERSION;
use crate::error::{Error, Result};
use crate::terminal::TerminalId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistenceErrorKind {
    FileMissing,
    Corruption,
    Permission,
    Network,
    Unknown,
}

impl PersistenceErrorKind {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => PersistenceErrorKind::FileMissing,
            io::ErrorKind::PermissionDenied => PersistenceErrorKind::Permission,
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => PersistenceErrorKind::Corruption,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut => PersistenceErrorKind::Network,
            _ => PersistenceErrorKind::Unknown,
        }
    }

    /// Classify any crate error. Errors that carried no kind are classified
    /// by message.
    pub fn categorize(err: &Error) -> Self {
        match err {
            Error::Persistence { kind, .. } => *kind,
            Error::Serialization(_) => PersistenceErrorKind::Corruption,
            other => {
                let message = other.to_string().to_ascii_lowercase();
                if message.contains("not found") || message.contains("no such file") {
                    PersistenceErrorKind::FileMissing
                } else if message.contains("permission") || message.contains("access denied") {
                    PersistenceErrorKind::Permission
                } else if message.contains("timed out") || message.contains("network") || message.contains("connection")
                {
                    PersistenceErrorKind::Network
                } else if message.contains("invalid") || message.contains("corrupt") || message.contains("parse") {
                    PersistenceErrorKind::Corruption
                } else {
                    PersistenceErrorKind::Unknown
                }
            }
        }
    }

    fn error(self, message: impl Into<String>) -> Error {
        Error::Persistence {
            kind: self,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTerminal {
    pub id: TerminalId,
    pub name: String,
    pub cwd: String,
    pub scrollback: Vec<String>,
    pub is_active: bool,
    pub terminal_number: usize,
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub terminals: Vec<PersistedTerminal>,
    pub active_terminal_id: Option<TerminalId>,
    pub timestamp: i64,
    pub version: u32,
    pub workspace_path: Option<String>,
}

impl SessionSnapshot {
    pub fn new(
        terminals: Vec<PersistedTerminal>,
        active_terminal_id: Option<TerminalId>,
        workspace_path: Option<String>,
    ) -> Self {
        Self {
            terminals,
            active_terminal_id,
            timestamp: crate::util::now_millis(),
            version: SNAPSHOT_VERSION,
            workspace_path,
        }
    }
}

/// Backing storage for one serialized snapshot.
pub trait SessionStore: Send {
    /// `Ok(None)` when nothing has been stored.
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, blob: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn describe(&self) -> String;
}

pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/sessions/<workspace key>.json`
    pub fn for_workspace(dir: &Path, workspace: Option<&Path>) -> Self {
        Self::new(dir.join("sessions").join(format!("{}.json", workspace_key(workspace))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(err) => Err(PersistenceErrorKind::from_io(&err).error(format!("{}: {err}", self.path.display()))),
        }
    }

    fn save(&self, blob: &str) -> Result<()> {
        crate::util::atomic_write(&self.path, blob.as_bytes())
            .map_err(|err| PersistenceErrorKind::from_io(&err).error(format!("{}: {err}", self.path.display())))
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PersistenceErrorKind::from_io(&err).error(format!("{}: {err}", self.path.display()))),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Default)]
struct MemoryState {
    blob: Option<String>,
    failure: Option<PersistenceErrorKind>,
    clears: usize,
}

/// In-process store. Clones share the same slot.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: impl Into<String>) -> Self {
        let store = Self::new();
        store.state.lock().blob = Some(blob.into());
        store
    }

    pub fn blob(&self) -> Option<String> {
        self.state.lock().blob.clone()
    }

    /// Make every operation fail with `kind` until reset with `None`.
    pub fn fail_with(&self, kind: Option<PersistenceErrorKind>) {
        self.state.lock().failure = kind;
    }

    pub fn clear_count(&self) -> usize {
        self.state.lock().clears
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<String>> {
        let state = self.state.lock();
        if let Some(kind) = state.failure {
            return Err(kind.error("memory store failure"));
        }
        Ok(state.blob.clone())
    }

    fn save(&self, blob: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(kind) = state.failure {
            return Err(kind.error("memory store failure"));
        }
        state.blob = Some(blob.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.blob = None;
        state.clears += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Validating front for a primary store with an optional fallback scope.
/// After a permission failure all traffic moves to the fallback.
pub struct SessionPersistence {
    primary: Box<dyn SessionStore>,
    fallback: Option<Box<dyn SessionStore>>,
    using_fallback: bool,
    limits: PersistenceSettings,
}

impl SessionPersistence {
    pub fn new(primary: Box<dyn SessionStore>, limits: PersistenceSettings) -> Self {
        Self {
            primary,
            fallback: None,
            using_fallback: false,
            limits,
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn SessionStore>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn using_fallback(&self) -> bool {
        self.using_fallback
    }

    pub fn scrollback_lines(&self) -> usize {
        self.limits.scrollback_lines
    }

    /// Load the stored session. Every recoverable failure yields `Ok(None)`;
    /// only unclassifiable errors are returned.
    pub fn restore(&mut self) -> Result<Option<SessionSnapshot>> {
        match self.active().load() {
            Ok(None) => Ok(None),
            Ok(Some(blob)) => Ok(self.validate(&blob)),
            Err(err) => self.recover_load(err),
        }
    }

    /// Reject oversized snapshots, then write through the active store.
    pub fn save(&mut self, snapshot: &SessionSnapshot) -> Result<()> {
        let blob = serde_json::to_string(snapshot)?;
        if blob.len() > self.limits.max_snapshot_bytes {
            return Err(Error::SnapshotTooLarge {
                size: blob.len(),
                limit: self.limits.max_snapshot_bytes,
            });
        }

        match self.active().save(&blob) {
            Ok(()) => {
                debug!(terminals = snapshot.terminals.len(), bytes = blob.len(), "session saved");
                Ok(())
            }
            Err(err) if PersistenceErrorKind::categorize(&err) == PersistenceErrorKind::Permission => {
                if !self.switch_to_fallback() {
                    return Err(err);
                }
                self.active().save(&blob)
            }
            Err(err) => Err(err),
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        self.active().clear()
    }

    fn active(&self) -> &dyn SessionStore {
        match (&self.fallback, self.using_fallback) {
            (Some(fallback), true) => fallback.as_ref(),
            _ => self.primary.as_ref(),
        }
    }

    fn switch_to_fallback(&mut self) -> bool {
        if self.using_fallback || self.fallback.is_none() {
            return false;
        }
        self.using_fallback = true;
        warn!(store = %self.active().describe(), "permission denied on session store, using fallback");
        true
    }

    fn recover_load(&mut self, err: Error) -> Result<Option<SessionSnapshot>> {
        match PersistenceErrorKind::categorize(&err) {
            PersistenceErrorKind::FileMissing => {
                debug!("no stored session");
                Ok(None)
            }
            PersistenceErrorKind::Corruption => {
                self.discard("unreadable session data");
                Ok(None)
            }
            PersistenceErrorKind::Permission => {
                if self.switch_to_fallback() {
                    return self.restore();
                }
                warn!(error = %err, "session store not accessible");
                Ok(None)
            }
            PersistenceErrorKind::Network => {
                warn!(error = %err, "session store unreachable, starting empty");
                Ok(None)
            }
            PersistenceErrorKind::Unknown => Err(err),
        }
    }

    fn validate(&mut self, blob: &str) -> Option<SessionSnapshot> {
        let mut snapshot = match serde_json::from_str::<SessionSnapshot>(blob) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.discard(&format!("invalid session data: {err}"));
                return None;
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            self.discard(&format!("unsupported session version {}", snapshot.version));
            return None;
        }

        let age_ms = crate::util::now_millis().saturating_sub(snapshot.timestamp);
        let expiry_ms = self.limits.expiry_days.saturating_mul(24 * 60 * 60 * 1000);
        if age_ms > expiry_ms {
            info!(age_days = age_ms / (24 * 60 * 60 * 1000), "stored session expired");
            if let Err(err) = self.active().clear() {
                warn!(error = %err, "failed to clear expired session");
            }
            return None;
        }

        snapshot.terminals.sort_by_key(|terminal| terminal.terminal_number);
        let limit = self.limits.scrollback_lines;
        for terminal in &mut snapshot.terminals {
            let excess = terminal.scrollback.len().saturating_sub(limit);
            terminal.scrollback.drain(..excess);
        }
        Some(snapshot)
    }

    fn discard(&self, reason: &str) {
        warn!(reason, "clearing stored session");
        if let Err(err) = self.active().clear() {
            warn!(error = %err, "failed to clear stored session");
        }
    }
}

/// Filesystem-safe key for a workspace path.
pub fn workspace_key(workspace: Option<&Path>) -> String {
    let Some(path) = workspace else {
        return "default".to_string();
    };
    let key: String = path
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let key = key.trim_matches('_');
    if key.is_empty() {
        "default".to_string()
    } else {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminal(id: &str, number: usize, lines: usize) -> PersistedTerminal {
        PersistedTerminal {
            id: TerminalId::new(id),
            name: format!("Terminal {number}"),
            cwd: "/work".into(),
            scrollback: (0..lines).map(|n| format!("line {n}")).collect(),
            is_active: number == 1,
            terminal_number: number,
            last_updated: crate::util::now_millis(),
        }
    }

    fn persistence(store: &MemorySessionStore) -> SessionPersistence {
        SessionPersistence::new(Box::new(store.clone()), PersistenceSettings::default())
    }

    #[test]
    fn saved_snapshot_restores_sorted_by_slot() {
        let store = MemorySessionStore::new();
        let mut persistence = persistence(&store);
        let snapshot = SessionSnapshot::new(
            vec![terminal("b", 2, 1), terminal("a", 1, 2)],
            Some(TerminalId::new("a")),
            Some("/work".into()),
        );
        persistence.save(&snapshot).unwrap();

        let restored = persistence.restore().unwrap().unwrap();
        let ids: Vec<_> = restored.terminals.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(restored.active_terminal_id, Some(TerminalId::new("a")));
    }

    #[test]
    fn corrupted_blob_is_cleared_and_treated_as_empty() {
        let store = MemorySessionStore::with_blob(r#"{"terminals": "nope"}"#);
        let mut persistence = persistence(&store);

        assert_eq!(persistence.restore().unwrap(), None);
        assert_eq!(store.blob(), None);
        assert_eq!(store.clear_count(), 1);
    }

    #[test]
    fn version_mismatch_counts_as_corruption() {
        let mut snapshot = SessionSnapshot::new(vec![terminal("a", 1, 0)], None, None);
        snapshot.version = 99;
        let store = MemorySessionStore::with_blob(serde_json::to_string(&snapshot).unwrap());

        assert_eq!(persistence(&store).restore().unwrap(), None);
        assert_eq!(store.blob(), None);
    }

    #[test]
    fn expired_snapshot_is_discarded() {
        let mut snapshot = SessionSnapshot::new(vec![terminal("a", 1, 0)], None, None);
        snapshot.timestamp -= 8 * 24 * 60 * 60 * 1000;
        let store = MemorySessionStore::with_blob(serde_json::to_string(&snapshot).unwrap());

        assert_eq!(persistence(&store).restore().unwrap(), None);
    }

    #[test]
    fn scrollback_is_trimmed_to_limit_on_restore() {
        let snapshot = SessionSnapshot::new(vec![terminal("a", 1, 10)], None, None);
        let store = MemorySessionStore::with_blob(serde_json::to_string(&snapshot).unwrap());
        let mut persistence = SessionPersistence::new(
            Box::new(store),
            PersistenceSettings {
                scrollback_lines: 3,
                ..PersistenceSettings::default()
            },
        );
        let restored = persistence.restore().unwrap().unwrap();
        assert_eq!(restored.terminals[0].scrollback, vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn oversized_snapshot_is_rejected() {
        let store = MemorySessionStore::new();
        let mut persistence = SessionPersistence::new(
            Box::new(store.clone()),
            PersistenceSettings {
                max_snapshot_bytes: 64,
                ..PersistenceSettings::default()
            },
        );
        let snapshot = SessionSnapshot::new(vec![terminal("a", 1, 20)], None, None);
        assert!(matches!(persistence.save(&snapshot), Err(Error::SnapshotTooLarge { limit: 64, .. })));
        assert_eq!(store.blob(), None);
    }

    #[test]
    fn permission_failure_moves_to_fallback_scope() {
        let primary = MemorySessionStore::new();
        primary.fail_with(Some(PersistenceErrorKind::Permission));
        let fallback = MemorySessionStore::new();
        let mut persistence = SessionPersistence::new(Box::new(primary.clone()), PersistenceSettings::default())
            .with_fallback(Box::new(fallback.clone()));

        assert_eq!(persistence.restore().unwrap(), None);
        assert!(persistence.using_fallback());

        let snapshot = SessionSnapshot::new(vec![terminal("a", 1, 1)], None, None);
        persistence.save(&snapshot).unwrap();
        assert!(fallback.blob().is_some());
        assert!(primary.blob().is_none());
    }

    #[test]
    fn network_failure_starts_empty_and_unknown_surfaces() {
        let store = MemorySessionStore::new();
        store.fail_with(Some(PersistenceErrorKind::Network));
        assert_eq!(persistence(&store).restore().unwrap(), None);

        store.fail_with(Some(PersistenceErrorKind::Unknown));
        let err = persistence(&store).restore().unwrap_err();
        assert_eq!(PersistenceErrorKind::categorize(&err), PersistenceErrorKind::Unknown);
    }

    #[test]
    fn file_store_missing_file_is_empty_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::for_workspace(dir.path(), Some(Path::new("/home/me/project")));
        assert!(store.path().ends_with("sessions/home_me_project.json"));

        let mut persistence = SessionPersistence::new(Box::new(store), PersistenceSettings::default());
        assert_eq!(persistence.restore().unwrap(), None);

        let snapshot = SessionSnapshot::new(vec![terminal("a", 1, 2)], None, None);
        persistence.save(&snapshot).unwrap();
        assert_eq!(persistence.restore().unwrap(), Some(snapshot));

        persistence.clear().unwrap();
        assert_eq!(persistence.restore().unwrap(), None);
    }

    #[test]
    fn messages_without_kind_are_categorized() {
        assert_eq!(
            PersistenceErrorKind::categorize(&Error::Io("No such file or directory".into())),
            PersistenceErrorKind::FileMissing
        );
        assert_eq!(
            PersistenceErrorKind::categorize(&Error::Io("Permission denied (os error 13)".into())),
            PersistenceErrorKind::Permission
        );
        assert_eq!(
            PersistenceErrorKind::categorize(&Error::Serialization("eof".into())),
            PersistenceErrorKind::Corruption
        );
    }
}
