//! Stored session inspection
//!
//! `session show` and `session clear` operate on the same store the host
//! uses for the given workspace.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::config::{self, HostSettings};
use crate::constants::SNAPSHOT_VERSION;
use crate::error::Result;
use crate::persistence::{FileSessionStore, PersistenceErrorKind, SessionPersistence, SessionSnapshot, SessionStore};

/// Session storage for `workspace`: the data dir first, the temp dir when
/// the data dir turns out not to be writable.
pub fn open_persistence(data_dir: &Path, settings: &HostSettings, workspace: Option<&Path>) -> SessionPersistence {
    let primary = FileSessionStore::for_workspace(data_dir, workspace);
    let fallback_dir = std::env::temp_dir().join(crate::constants::APP_NAME);
    let fallback = FileSessionStore::for_workspace(&fallback_dir, workspace);
    SessionPersistence::new(Box::new(primary), settings.persistence.clone()).with_fallback(Box::new(fallback))
}

pub fn show(settings: &HostSettings, workspace: Option<&Path>) -> Result<()> {
    crate::logging::init_cli_logging();
    let data_dir = config::data_dir()?;
    let workspace = resolve_workspace(settings, workspace);
    let store = FileSessionStore::for_workspace(&data_dir, workspace.as_deref());
    print!("{}", inspect(&store)?);
    Ok(())
}

/// Read-only view of the stored session. Unlike a host restore, nothing
/// unreadable or outdated is removed.
fn inspect(store: &FileSessionStore) -> Result<String> {
    let path = store.path();
    let blob = match store.load() {
        Ok(Some(blob)) => blob,
        Ok(None) => return Ok(format!("No stored session at {}\n", path.display())),
        Err(err) if PersistenceErrorKind::categorize(&err) == PersistenceErrorKind::FileMissing => {
            return Ok(format!("No stored session at {}\n", path.display()))
        }
        Err(err) => return Err(err),
    };

    match serde_json::from_str::<SessionSnapshot>(&blob) {
        Ok(snapshot) => Ok(describe(path, &snapshot)),
        Err(err) => Ok(format!(
            "Stored session at {} is unreadable and will be discarded by the host: {err}\n",
            path.display()
        )),
    }
}

pub fn clear(settings: &HostSettings, workspace: Option<&Path>) -> Result<()> {
    crate::logging::init_cli_logging();
    let data_dir = config::data_dir()?;
    let workspace = resolve_workspace(settings, workspace);
    let mut persistence = open_persistence(&data_dir, settings, workspace.as_deref());
    persistence.clear()?;
    println!("Stored session cleared");
    Ok(())
}

fn resolve_workspace(settings: &HostSettings, workspace: Option<&Path>) -> Option<PathBuf> {
    workspace
        .map(|path| std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
        .or_else(|| settings.workspace_path.clone())
}

fn describe(path: &Path, snapshot: &SessionSnapshot) -> String {
    let saved = DateTime::<Utc>::from_timestamp_millis(snapshot.timestamp)
        .map(|time| time.to_rfc3339())
        .unwrap_or_else(|| snapshot.timestamp.to_string());

    let mut out = format!("Stored session: {}\n", path.display());
    out.push_str(&format!("  Saved:  {saved}\n"));
    if snapshot.version != SNAPSHOT_VERSION {
        out.push_str(&format!(
            "  Version {} is not supported and will be discarded by the host\n",
            snapshot.version
        ));
    }
    if let Some(workspace) = &snapshot.workspace_path {
        out.push_str(&format!("  Workspace: {workspace}\n"));
    }
    for terminal in &snapshot.terminals {
        let marker = if terminal.is_active { "*" } else { " " };
        out.push_str(&format!(
            " {marker}{}. {} ({}) - {} scrollback lines\n",
            terminal.terminal_number,
            terminal.name,
            terminal.cwd,
            terminal.scrollback.len()
        ));
    }
    out
}
