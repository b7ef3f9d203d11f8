use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentStatus, AgentType};
use crate::config::HostSettings;
use crate::terminal::{TerminalId, TerminalInfo};

/// Messages sent by the UI. One JSON object per line, tagged by `command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum UiMessage {
    /// UI message listener is attached
    #[serde(alias = "ready")]
    WebviewReady,
    /// UI handlers are wired; terminal traffic may begin
    WebviewInitialized,
    #[serde(rename_all = "camelCase")]
    TerminalInitializationComplete { terminal_id: TerminalId },
    #[serde(rename_all = "camelCase")]
    TerminalReady { terminal_id: TerminalId },
    #[serde(rename_all = "camelCase")]
    Input { terminal_id: TerminalId, data: String },
    #[serde(rename_all = "camelCase")]
    Resize { terminal_id: TerminalId, cols: u16, rows: u16 },
    #[serde(rename_all = "camelCase")]
    CreateTerminal {
        #[serde(default)]
        ui_id: Option<TerminalId>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DeleteTerminal { terminal_id: TerminalId },
    #[serde(rename_all = "camelCase")]
    FocusTerminal { terminal_id: TerminalId },
    RequestStateSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    WebviewReady,
    WebviewInitialized,
    TerminalInitializationComplete,
    TerminalReady,
    Input,
    Resize,
    CreateTerminal,
    DeleteTerminal,
    FocusTerminal,
    RequestStateSync,
}

impl CommandKind {
    pub const ALL: [CommandKind; 10] = [
        CommandKind::WebviewReady,
        CommandKind::WebviewInitialized,
        CommandKind::TerminalInitializationComplete,
        CommandKind::TerminalReady,
        CommandKind::Input,
        CommandKind::Resize,
        CommandKind::CreateTerminal,
        CommandKind::DeleteTerminal,
        CommandKind::FocusTerminal,
        CommandKind::RequestStateSync,
    ];

    /// Handshake commands that must survive arriving before their handler.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            CommandKind::WebviewReady
                | CommandKind::WebviewInitialized
                | CommandKind::TerminalInitializationComplete
                | CommandKind::TerminalReady
        )
    }
}

impl UiMessage {
    pub fn kind(&self) -> CommandKind {
        match self {
            UiMessage::WebviewReady => CommandKind::WebviewReady,
            UiMessage::WebviewInitialized => CommandKind::WebviewInitialized,
            UiMessage::TerminalInitializationComplete { .. } => CommandKind::TerminalInitializationComplete,
            UiMessage::TerminalReady { .. } => CommandKind::TerminalReady,
            UiMessage::Input { .. } => CommandKind::Input,
            UiMessage::Resize { .. } => CommandKind::Resize,
            UiMessage::CreateTerminal { .. } => CommandKind::CreateTerminal,
            UiMessage::DeleteTerminal { .. } => CommandKind::DeleteTerminal,
            UiMessage::FocusTerminal { .. } => CommandKind::FocusTerminal,
            UiMessage::RequestStateSync => CommandKind::RequestStateSync,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Agent status for one terminal inside a full-state sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTerminalState {
    pub status: AgentStatus,
    pub agent_type: Option<AgentType>,
}

/// Messages pushed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum HostMessage {
    ExtensionReady {
        timestamp: i64,
    },
    Version {
        version: String,
    },
    Settings {
        settings: HostSettings,
    },
    TerminalCreated(TerminalInfo),
    #[serde(rename_all = "camelCase")]
    StartOutput {
        terminal_id: TerminalId,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Output {
        terminal_id: TerminalId,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    TerminalRemoved {
        terminal_id: TerminalId,
    },
    #[serde(rename_all = "camelCase")]
    TerminalExited {
        terminal_id: TerminalId,
        exit_code: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    FocusTerminal {
        terminal_id: TerminalId,
    },
    /// Replaces the UI's agent display wholesale
    #[serde(rename_all = "camelCase")]
    CliAgentFullStateSync {
        terminal_states: BTreeMap<TerminalId, AgentTerminalState>,
    },
    #[serde(rename_all = "camelCase")]
    InitializationComplete {
        terminal_count: usize,
        timestamp: i64,
    },
    Notification {
        level: NotificationLevel,
        message: String,
    },
}

impl HostMessage {
    pub fn command(&self) -> &'static str {
        match self {
            HostMessage::ExtensionReady { .. } => "extensionReady",
            HostMessage::Version { .. } => "version",
            HostMessage::Settings { .. } => "settings",
            HostMessage::TerminalCreated(_) => "terminalCreated",
            HostMessage::StartOutput { .. } => "startOutput",
            HostMessage::Output { .. } => "output",
            HostMessage::TerminalRemoved { .. } => "terminalRemoved",
            HostMessage::TerminalExited { .. } => "terminalExited",
            HostMessage::FocusTerminal { .. } => "focusTerminal",
            HostMessage::CliAgentFullStateSync { .. } => "cliAgentFullStateSync",
            HostMessage::InitializationComplete { .. } => "initializationComplete",
            HostMessage::Notification { .. } => "notification",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ready_alias_parses_as_webview_ready() {
        let parsed: UiMessage = serde_json::from_str(r#"{"command":"ready"}"#).unwrap();
        assert_eq!(parsed, UiMessage::WebviewReady);
        let parsed: UiMessage = serde_json::from_str(r#"{"command":"webviewReady"}"#).unwrap();
        assert_eq!(parsed.kind(), CommandKind::WebviewReady);
    }

    #[test]
    fn terminal_commands_use_camel_case_fields() {
        let parsed: UiMessage =
            serde_json::from_str(r#"{"command":"resize","terminalId":"t1","cols":100,"rows":30}"#).unwrap();
        assert_eq!(
            parsed,
            UiMessage::Resize {
                terminal_id: TerminalId::new("t1"),
                cols: 100,
                rows: 30
            }
        );

        let parsed: UiMessage = serde_json::from_str(r#"{"command":"createTerminal"}"#).unwrap();
        assert_eq!(
            parsed,
            UiMessage::CreateTerminal {
                ui_id: None,
                cwd: None,
                name: None
            }
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(serde_json::from_str::<UiMessage>(r#"{"command":"selfDestruct"}"#).is_err());
        assert!(serde_json::from_str::<UiMessage>(r#"{"command":"input","terminalId":"t"}"#).is_err());
    }

    #[test]
    fn terminal_created_flattens_info() {
        let message = HostMessage::TerminalCreated(TerminalInfo {
            id: TerminalId::new("t1"),
            name: "Terminal 1".into(),
            cwd: "/work".into(),
            is_active: true,
            terminal_number: 1,
        });
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "command": "terminalCreated",
                "id": "t1",
                "name": "Terminal 1",
                "cwd": "/work",
                "isActive": true,
                "terminalNumber": 1
            })
        );
    }

    #[test]
    fn full_state_sync_is_keyed_by_terminal() {
        let mut terminal_states = BTreeMap::new();
        terminal_states.insert(
            TerminalId::new("t1"),
            AgentTerminalState {
                status: AgentStatus::Connected,
                agent_type: Some(AgentType::Claude),
            },
        );
        let value = serde_json::to_value(HostMessage::CliAgentFullStateSync { terminal_states }).unwrap();
        assert_eq!(value["command"], "cliAgentFullStateSync");
        assert_eq!(value["terminalStates"]["t1"]["status"], "connected");
        assert_eq!(value["terminalStates"]["t1"]["agentType"], "claude");
    }

    #[test]
    fn only_handshake_commands_are_critical() {
        let critical: Vec<_> = CommandKind::ALL.into_iter().filter(|k| k.is_critical()).collect();
        assert_eq!(critical.len(), 4);
        assert!(!CommandKind::Input.is_critical());
    }
}
