use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scheduler::Clock;
use crate::terminal::TerminalId;

/// Per-terminal initialization progress. Ordering is meaningful: progress
/// only moves to higher values, except into `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InitializationState {
    Idle = 0,
    ViewPending = 1,
    ViewReady = 2,
    PtySpawned = 3,
    ShellInitializing = 4,
    ShellInitialized = 5,
    OutputStreaming = 6,
    PromptReady = 7,
    Failed = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        from: InitializationState,
        to: InitializationState,
    },
    /// Same state requested again; nothing changed
    Duplicate,
    /// Lower state requested; dropped so stale acks cannot rewind progress
    Regression {
        current: InitializationState,
        requested: InitializationState,
    },
    UnknownTerminal,
}

impl TransitionOutcome {
    pub fn applied(self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone)]
pub struct InitializationRecord {
    pub state: InitializationState,
    pub retries: u32,
    /// Set once the terminal reached `OutputStreaming`; survives a later failure
    pub streamed: bool,
    pub updated_at: Instant,
    pub context: Option<String>,
}

pub struct InitializationStateMachine {
    records: HashMap<TerminalId, InitializationRecord>,
    clock: Arc<dyn Clock>,
}

impl InitializationStateMachine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: HashMap::new(),
            clock,
        }
    }

    /// Start tracking a newly created terminal at `Idle`. Re-registering an
    /// existing id keeps its progress.
    pub fn register(&mut self, id: &TerminalId) {
        let now = self.clock.now();
        self.records.entry(id.clone()).or_insert_with(|| InitializationRecord {
            state: InitializationState::Idle,
            retries: 0,
            streamed: false,
            updated_at: now,
            context: None,
        });
    }

    pub fn get_state(&self, id: &str) -> Option<InitializationState> {
        self.records.get(id).map(|record| record.state)
    }

    pub fn record(&self, id: &str) -> Option<&InitializationRecord> {
        self.records.get(id)
    }

    /// A terminal that failed after streaming began keeps streaming; the
    /// failure only means its shell never reported a prompt. One that failed
    /// earlier never opens.
    pub fn is_output_allowed(&self, id: &str) -> bool {
        self.records.get(id).is_some_and(|record| match record.state {
            InitializationState::OutputStreaming | InitializationState::PromptReady => true,
            InitializationState::Failed => record.streamed,
            _ => false,
        })
    }

    pub fn reset(&mut self, id: &str) {
        self.records.remove(id);
    }

    pub fn increment_retry(&mut self, id: &str) -> u32 {
        match self.records.get_mut(id) {
            Some(record) => {
                record.retries += 1;
                record.retries
            }
            None => 0,
        }
    }

    pub fn mark_view_pending(&mut self, id: &str, context: &str) -> TransitionOutcome {
        self.transition(id, InitializationState::ViewPending, context)
    }

    pub fn mark_view_ready(&mut self, id: &str, context: &str) -> TransitionOutcome {
        self.transition(id, InitializationState::ViewReady, context)
    }

    pub fn mark_pty_spawned(&mut self, id: &str, context: &str) -> TransitionOutcome {
        self.transition(id, InitializationState::PtySpawned, context)
    }

    pub fn mark_shell_initializing(&mut self, id: &str, context: &str) -> TransitionOutcome {
        self.transition(id, InitializationState::ShellInitializing, context)
    }

    pub fn mark_shell_initialized(&mut self, id: &str, context: &str) -> TransitionOutcome {
        self.transition(id, InitializationState::ShellInitialized, context)
    }

    pub fn mark_output_streaming(&mut self, id: &str, context: &str) -> TransitionOutcome {
        self.transition(id, InitializationState::OutputStreaming, context)
    }

    pub fn mark_prompt_ready(&mut self, id: &str, context: &str) -> TransitionOutcome {
        self.transition(id, InitializationState::PromptReady, context)
    }

    /// Always accepted from any live state.
    pub fn mark_failed(&mut self, id: &str, context: &str) -> TransitionOutcome {
        self.transition(id, InitializationState::Failed, context)
    }

    pub fn transition(&mut self, id: &str, to: InitializationState, context: &str) -> TransitionOutcome {
        let now = self.clock.now();
        let Some(record) = self.records.get_mut(id) else {
            debug!(terminal_id = %id, requested = ?to, context, "transition for untracked terminal ignored");
            return TransitionOutcome::UnknownTerminal;
        };

        let from = record.state;
        if from == to {
            debug!(terminal_id = %id, state = ?to, context, "duplicate transition ignored");
            return TransitionOutcome::Duplicate;
        }
        if to < from && to != InitializationState::Failed {
            warn!(
                terminal_id = %id,
                current = ?from,
                requested = ?to,
                context,
                "state regression blocked"
            );
            return TransitionOutcome::Regression {
                current: from,
                requested: to,
            };
        }

        record.state = to;
        if matches!(to, InitializationState::OutputStreaming | InitializationState::PromptReady) {
            record.streamed = true;
        }
        record.updated_at = now;
        record.context = Some(context.to_string());
        info!(terminal_id = %id, from = ?from, to = ?to, context, "initialization state changed");
        TransitionOutcome::Applied { from, to }
    }

    pub fn tracked(&self) -> impl Iterator<Item = (&TerminalId, InitializationState)> {
        self.records.iter().map(|(id, record)| (id, record.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use InitializationState::*;

    fn machine_with(id: &str) -> InitializationStateMachine {
        let mut machine = InitializationStateMachine::new(Arc::new(ManualScheduler::new()));
        machine.register(&TerminalId::new(id));
        machine
    }

    #[test]
    fn forward_transitions_apply_and_may_skip_stages() {
        let mut machine = machine_with("t");
        assert!(machine.mark_view_pending("t", "announce").applied());
        assert!(machine.mark_pty_spawned("t", "spawn").applied());
        assert_eq!(machine.get_state("t"), Some(PtySpawned));
    }

    #[test]
    fn regressions_are_dropped() {
        let mut machine = machine_with("t");
        machine.mark_output_streaming("t", "flush");
        let outcome = machine.mark_view_ready("t", "late ack");

        assert_eq!(
            outcome,
            TransitionOutcome::Regression {
                current: OutputStreaming,
                requested: ViewReady
            }
        );
        assert_eq!(machine.get_state("t"), Some(OutputStreaming));
    }

    #[test]
    fn state_never_decreases_except_into_failed() {
        let mut machine = machine_with("t");
        let sequence = [
            ViewPending, ShellInitialized, ViewReady, PromptReady, OutputStreaming, Idle, PromptReady,
        ];
        let mut last = Idle;
        for target in sequence {
            machine.transition("t", target, "fuzz");
            let state = machine.get_state("t").unwrap();
            assert!(state >= last);
            last = state;
        }
        assert!(machine.mark_failed("t", "boom").applied());
        assert_eq!(machine.get_state("t"), Some(Failed));
        assert!(!machine.mark_prompt_ready("t", "after failure").applied());
    }

    #[test]
    fn prompt_ready_twice_is_idempotent() {
        let mut machine = machine_with("t");
        assert!(machine.mark_prompt_ready("t", "prompt").applied());
        assert_eq!(machine.mark_prompt_ready("t", "prompt"), TransitionOutcome::Duplicate);
        assert_eq!(machine.get_state("t"), Some(PromptReady));
    }

    #[test]
    fn output_gate_opens_at_streaming() {
        let mut machine = machine_with("t");
        machine.mark_shell_initialized("t", "init");
        assert!(!machine.is_output_allowed("t"));
        machine.mark_output_streaming("t", "start");
        assert!(machine.is_output_allowed("t"));
        machine.mark_failed("t", "boom");
        assert!(machine.is_output_allowed("t"));
    }

    #[test]
    fn failure_before_streaming_keeps_gate_closed() {
        let mut machine = machine_with("t");
        machine.mark_view_pending("t", "announce");
        assert!(machine.mark_failed("t", "spawn failed").applied());
        assert!(!machine.is_output_allowed("t"));
    }

    #[test]
    fn reset_and_unknown_terminals() {
        let mut machine = machine_with("t");
        assert_eq!(machine.increment_retry("t"), 1);
        machine.reset("t");
        assert_eq!(machine.get_state("t"), None);
        assert_eq!(machine.mark_view_ready("t", "stale"), TransitionOutcome::UnknownTerminal);
        assert_eq!(machine.increment_retry("t"), 0);
    }
}
