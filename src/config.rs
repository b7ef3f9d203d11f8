use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{
    AGENT_GRACE_PERIOD_MS, APP_NAME, DEFAULT_MAX_TERMINALS, DEFAULT_MIN_TERMINALS, DEFAULT_TERMINAL_COUNT,
    MAX_SNAPSHOT_BYTES, OUTPUT_BUFFER_LIMIT_BYTES, PENDING_QUEUE_LIMIT, SCROLLBACK_LINES, SNAPSHOT_EXPIRY_DAYS,
};
use crate::error::{Error, Result};
use crate::init::WatchdogOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub max_snapshot_bytes: usize,
    pub expiry_days: i64,
    pub scrollback_lines: usize,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_snapshot_bytes: MAX_SNAPSHOT_BYTES,
            expiry_days: SNAPSHOT_EXPIRY_DAYS,
            scrollback_lines: SCROLLBACK_LINES,
        }
    }
}

/// Host settings, read from `<home>/.termdeck/config/settings.json`.
/// Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostSettings {
    pub max_terminals: usize,
    pub min_terminals: usize,
    pub default_terminal_count: usize,
    pub shell_override: Option<String>,
    pub ack_watchdog: WatchdogOptions,
    pub prompt_watchdog: WatchdogOptions,
    pub agent_grace_period_ms: u64,
    pub pending_queue_limit: usize,
    pub output_buffer_limit_bytes: usize,
    pub persistence: PersistenceSettings,
    pub workspace_path: Option<PathBuf>,
    /// Listen port for `serve`; 0 picks a free port
    pub port: u16,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            max_terminals: DEFAULT_MAX_TERMINALS,
            min_terminals: DEFAULT_MIN_TERMINALS,
            default_terminal_count: DEFAULT_TERMINAL_COUNT,
            shell_override: None,
            ack_watchdog: WatchdogOptions::ack(),
            prompt_watchdog: WatchdogOptions::prompt(),
            agent_grace_period_ms: AGENT_GRACE_PERIOD_MS,
            pending_queue_limit: PENDING_QUEUE_LIMIT,
            output_buffer_limit_bytes: OUTPUT_BUFFER_LIMIT_BYTES,
            persistence: PersistenceSettings::default(),
            workspace_path: None,
            port: 0,
        }
    }
}

impl HostSettings {
    /// Read settings from `path`. A missing file yields defaults; a corrupt
    /// one is logged and also yields defaults.
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "no settings file, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str::<HostSettings>(&content) {
            Ok(settings) => settings.normalized(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt settings file, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        crate::util::atomic_write(path, json.as_bytes())?;
        Ok(())
    }

    pub fn agent_grace_period(&self) -> Duration {
        Duration::from_millis(self.agent_grace_period_ms)
    }

    /// Clamp terminal limits into a consistent range.
    pub fn normalized(mut self) -> Self {
        self.max_terminals = self.max_terminals.max(1);
        self.min_terminals = self.min_terminals.min(self.max_terminals);
        self.default_terminal_count = self
            .default_terminal_count
            .clamp(self.min_terminals.max(1), self.max_terminals);
        self.ack_watchdog.max_attempts = self.ack_watchdog.max_attempts.max(1);
        self.prompt_watchdog.max_attempts = self.prompt_watchdog.max_attempts.max(1);
        self
    }
}

/// `~/.termdeck`, holding configuration.
pub fn termdeck_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!(".{APP_NAME}"))
}

pub fn settings_path(home: &Path) -> PathBuf {
    home.join("config").join("settings.json")
}

/// Platform data directory for sessions, logs and the port file.
pub fn data_dir() -> Result<PathBuf> {
    Ok(dirs::data_dir()
        .ok_or_else(|| Error::Config("could not find data directory".into()))?
        .join(APP_NAME))
}

pub fn port_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("daemon").join("port")
}
