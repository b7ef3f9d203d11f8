//! CLI agent tracking
//!
//! Terminals may run an interactive AI agent. The detector turns terminal
//! output into connect/terminate signals and the store decides which single
//! terminal currently holds the connected agent.

mod detector;
mod store;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use detector::{AgentDetector, AgentSignal, AgentSignalKind, PatternAgentDetector};
pub use store::{
    AgentObserver, AgentStateStore, AgentStatusChange, AgentSubscription, ConnectOutcome, ConnectedAgent,
    DisconnectedAgent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Claude,
    Gemini,
    Codex,
    OpenCode,
    Copilot,
}

impl AgentType {
    pub const ALL: [AgentType; 5] = [
        AgentType::Claude,
        AgentType::Gemini,
        AgentType::Codex,
        AgentType::OpenCode,
        AgentType::Copilot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Gemini => "gemini",
            AgentType::Codex => "codex",
            AgentType::OpenCode => "opencode",
            AgentType::Copilot => "copilot",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Connected,
    Disconnected,
    None,
}
