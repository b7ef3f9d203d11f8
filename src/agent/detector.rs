use std::collections::HashMap;

use tracing::debug;

use super::AgentType;
use crate::terminal::shell::strip_ansi;
use crate::terminal::TerminalId;

// Bytes of previous output kept so a banner split across reads still matches.
const CARRY_CHARS: usize = 96;

// Shell-integration prompt mark; seeing it again means the agent exited.
const PROMPT_MARKERS: &[&str] = &["\x1b]133;A", "\x1b]633;A"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSignalKind {
    Connected,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSignal {
    pub agent_type: AgentType,
    pub kind: AgentSignalKind,
}

/// Turns raw terminal output into agent lifecycle signals.
pub trait AgentDetector: Send {
    fn detect(&mut self, terminal_id: &TerminalId, output: &str) -> Vec<AgentSignal>;

    fn forget(&mut self, _terminal_id: &TerminalId) {}
}

struct AgentPattern {
    agent_type: AgentType,
    startup: &'static [&'static str],
    exit: &'static [&'static str],
}

const PATTERNS: &[AgentPattern] = &[
    AgentPattern {
        agent_type: AgentType::Claude,
        startup: &["welcome to claude code", "claude code v"],
        exit: &["claude code session ended"],
    },
    AgentPattern {
        agent_type: AgentType::Gemini,
        startup: &["gemini cli", "welcome to gemini"],
        exit: &["agent powering down"],
    },
    AgentPattern {
        agent_type: AgentType::Codex,
        startup: &["openai codex", ">_ codex"],
        exit: &["codex session ended"],
    },
    AgentPattern {
        agent_type: AgentType::OpenCode,
        startup: &["opencode v", "welcome to opencode"],
        exit: &["opencode exited"],
    },
    AgentPattern {
        agent_type: AgentType::Copilot,
        startup: &["github copilot cli", "welcome to github copilot"],
        exit: &["copilot session ended"],
    },
];

/// Banner and prompt-marker matching. An agent counts as terminated when its
/// exit phrase appears or the shell prints its integration prompt mark again.
#[derive(Default)]
pub struct PatternAgentDetector {
    active: HashMap<TerminalId, AgentType>,
    carry: HashMap<TerminalId, String>,
}

impl PatternAgentDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_agent(&self, terminal_id: &str) -> Option<AgentType> {
        self.active.get(terminal_id).copied()
    }

    fn remember_tail(&mut self, terminal_id: &TerminalId, haystack: &str) {
        let tail: String = {
            let count = haystack.chars().count();
            haystack.chars().skip(count.saturating_sub(CARRY_CHARS)).collect()
        };
        self.carry.insert(terminal_id.clone(), tail);
    }
}

impl AgentDetector for PatternAgentDetector {
    fn detect(&mut self, terminal_id: &TerminalId, output: &str) -> Vec<AgentSignal> {
        let mut signals = Vec::new();

        if let Some(agent_type) = self.active.get(terminal_id).copied() {
            let raw_prompt = PROMPT_MARKERS.iter().any(|marker| output.contains(marker));
            let lowered = strip_ansi(output).to_lowercase();
            let exit_phrase = PATTERNS
                .iter()
                .filter(|pattern| pattern.agent_type == agent_type)
                .flat_map(|pattern| pattern.exit.iter())
                .any(|phrase| lowered.contains(phrase));
            if raw_prompt || exit_phrase {
                debug!(terminal_id = %terminal_id, agent = %agent_type, "agent exit detected");
                self.active.remove(terminal_id);
                self.carry.remove(terminal_id);
                signals.push(AgentSignal {
                    agent_type,
                    kind: AgentSignalKind::Terminated,
                });
                return signals;
            }
        }

        let mut haystack = self.carry.remove(terminal_id).unwrap_or_default();
        haystack.push_str(&strip_ansi(output).to_lowercase());

        let detected = PATTERNS.iter().find_map(|pattern| {
            pattern
                .startup
                .iter()
                .any(|banner| haystack.contains(banner))
                .then_some(pattern.agent_type)
        });

        match detected {
            Some(agent_type) if self.active.get(terminal_id) != Some(&agent_type) => {
                debug!(terminal_id = %terminal_id, agent = %agent_type, "agent startup detected");
                self.active.insert(terminal_id.clone(), agent_type);
                signals.push(AgentSignal {
                    agent_type,
                    kind: AgentSignalKind::Connected,
                });
            }
            _ => self.remember_tail(terminal_id, &haystack),
        }
        signals
    }

    fn forget(&mut self, terminal_id: &TerminalId) {
        self.active.remove(terminal_id);
        self.carry.remove(terminal_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> TerminalId {
        TerminalId::new("t")
    }

    #[test]
    fn banner_connects_once() {
        let mut detector = PatternAgentDetector::new();
        let signals = detector.detect(&id(), "\x1b[1m✻ Welcome to Claude Code!\x1b[0m\r\n");
        assert_eq!(
            signals,
            vec![AgentSignal {
                agent_type: AgentType::Claude,
                kind: AgentSignalKind::Connected
            }]
        );
        assert!(detector.detect(&id(), "Welcome to Claude Code again").is_empty());
    }

    #[test]
    fn banner_split_across_chunks_is_detected() {
        let mut detector = PatternAgentDetector::new();
        assert!(detector.detect(&id(), "starting Gemini").is_empty());
        let signals = detector.detect(&id(), " CLI ...");
        assert_eq!(signals[0].agent_type, AgentType::Gemini);
    }

    #[test]
    fn prompt_marker_terminates_active_agent() {
        let mut detector = PatternAgentDetector::new();
        detector.detect(&id(), "OpenAI Codex (research preview)");
        let signals = detector.detect(&id(), "bye\r\n\x1b]133;A\x07$ ");
        assert_eq!(
            signals,
            vec![AgentSignal {
                agent_type: AgentType::Codex,
                kind: AgentSignalKind::Terminated
            }]
        );
        assert_eq!(detector.active_agent("t"), None);
    }

    #[test]
    fn plain_shell_output_is_ignored() {
        let mut detector = PatternAgentDetector::new();
        assert!(detector.detect(&id(), "ls -la\r\ntotal 0\r\n\x1b]133;A\x07$ ").is_empty());
    }
}
