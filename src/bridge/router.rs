use std::collections::{HashSet, VecDeque};

use tracing::debug;

use super::protocol::{CommandKind, UiMessage};

/// Tracks which inbound commands have handlers. Critical handshake commands
/// that arrive before registration are parked and replayed in order.
#[derive(Debug, Default)]
pub struct CommandRouter {
    registered: HashSet<CommandKind>,
    parked: VecDeque<UiMessage>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the message when it can be handled now.
    pub fn route(&mut self, message: UiMessage) -> Option<UiMessage> {
        let kind = message.kind();
        if self.registered.contains(&kind) {
            return Some(message);
        }
        if kind.is_critical() {
            debug!(?kind, parked = self.parked.len() + 1, "no handler yet, command parked");
            self.parked.push_back(message);
        } else {
            debug!(?kind, "no handler registered, command dropped");
        }
        None
    }

    /// Register handlers and return parked messages that are now routable,
    /// in arrival order.
    pub fn register(&mut self, kinds: &[CommandKind]) -> Vec<UiMessage> {
        self.registered.extend(kinds.iter().copied());
        let mut ready = Vec::new();
        let mut still_parked = VecDeque::with_capacity(self.parked.len());
        for message in self.parked.drain(..) {
            if self.registered.contains(&message.kind()) {
                ready.push(message);
            } else {
                still_parked.push_back(message);
            }
        }
        self.parked = still_parked;
        if !ready.is_empty() {
            debug!(replayed = ready.len(), "replaying parked commands");
        }
        ready
    }

    pub fn register_all(&mut self) -> Vec<UiMessage> {
        self.register(&CommandKind::ALL)
    }

    pub fn unregister_all(&mut self) {
        self.registered.clear();
        self.parked.clear();
    }

    pub fn is_registered(&self, kind: CommandKind) -> bool {
        self.registered.contains(&kind)
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }
}
