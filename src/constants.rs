//! Protocol and host constants
//!
//! Defaults shared by the settings layer, the watchdog and the stores.

/// Application name used for data directories and log files
pub const APP_NAME: &str = "termdeck";

/// Value exported as `TERM_PROGRAM` inside every terminal
pub const TERM_PROGRAM: &str = "termdeck";

/// Upper bound on concurrently open terminals
pub const DEFAULT_MAX_TERMINALS: usize = 5;

/// Lower bound enforced by non-forced removal
pub const DEFAULT_MIN_TERMINALS: usize = 1;

/// Terminals created when nothing could be restored
pub const DEFAULT_TERMINAL_COUNT: usize = 1;

/// Ack phase: UI confirms it registered a new terminal (worst case ~10.5s)
pub const ACK_INITIAL_DELAY_MS: u64 = 700;
pub const ACK_MAX_ATTEMPTS: u32 = 4;
pub const ACK_BACKOFF_FACTOR: f64 = 2.0;

/// Prompt phase: single grace period before falling back to safe mode
pub const PROMPT_INITIAL_DELAY_MS: u64 = 1000;
pub const PROMPT_MAX_ATTEMPTS: u32 = 1;
pub const PROMPT_BACKOFF_FACTOR: f64 = 1.0;

/// Window during which a disconnected terminal cannot be reconnected
pub const AGENT_GRACE_PERIOD_MS: u64 = 2000;

/// Outbound messages held while the UI is not ready
pub const PENDING_QUEUE_LIMIT: usize = 512;

/// Buffered-but-ungated PTY output kept per terminal
pub const OUTPUT_BUFFER_LIMIT_BYTES: usize = 1024 * 1024;

/// Scrollback lines kept per terminal for persistence
pub const SCROLLBACK_LINES: usize = 1000;

/// Serialized session snapshots larger than this are rejected
pub const MAX_SNAPSHOT_BYTES: usize = 10 * 1024 * 1024;

/// Snapshots older than this are discarded on load
pub const SNAPSHOT_EXPIRY_DAYS: i64 = 7;

/// Current persisted session format version
pub const SNAPSHOT_VERSION: u32 = 1;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;
