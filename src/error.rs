use thiserror::Error;

use crate::persistence::PersistenceErrorKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Terminal not found: {0}")]
    TerminalNotFound(String),

    #[error("Terminal limit reached ({max} terminals)")]
    TerminalLimit { max: usize },

    #[error("Cannot remove terminal: at least {min} terminal(s) must remain")]
    MinimumTerminals { min: usize },

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Persistence error ({kind:?}): {message}")]
    Persistence {
        kind: PersistenceErrorKind,
        message: String,
    },

    #[error("Session snapshot is {size} bytes, exceeding the {limit} byte limit")]
    SnapshotTooLarge { size: usize, limit: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Orchestration error: {0}")]
    Orchestration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// Messages surfaced by transports that have already been torn down.
const DISPOSED_MARKERS: &[&str] = &["disposed", "channel closed", "connection closed", "broken pipe"];

impl Error {
    /// True when a transport error only means the UI side is already gone.
    pub fn is_transport_disposed(&self) -> bool {
        match self {
            Error::Transport(message) => {
                let lowered = message.to_ascii_lowercase();
                DISPOSED_MARKERS.iter().any(|marker| lowered.contains(marker))
            }
            _ => false,
        }
    }
}
