use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::{AgentStatus, AgentType};
use crate::scheduler::Clock;
use crate::terminal::TerminalId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatusChange {
    pub terminal_id: TerminalId,
    pub status: AgentStatus,
    pub agent_type: Option<AgentType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedAgent {
    pub agent_type: AgentType,
    pub since: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedAgent {
    pub terminal_id: TerminalId,
    pub agent_type: AgentType,
    pub agent_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    /// Terminal lost its agent within the grace period; treated as replayed
    /// output and ignored
    RejectedGracePeriod,
}

pub type AgentObserver = Arc<dyn Fn(&AgentStatusChange) + Send + Sync>;

#[derive(Default)]
struct ObserverRegistry {
    next_id: u64,
    observers: Vec<(u64, AgentObserver)>,
}

/// Keeps an observer registered until dropped.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct AgentSubscription {
    id: u64,
    registry: Weak<Mutex<ObserverRegistry>>,
}

impl AgentSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for AgentSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().observers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Which terminal holds the connected CLI agent, and which terminals recently
/// lost theirs. All mutation goes through these methods; at most one terminal
/// is connected and it never also appears as disconnected.
pub struct AgentStateStore {
    connected: Option<ConnectedAgent>,
    disconnected: HashMap<TerminalId, DisconnectedAgent>,
    last_disconnect: HashMap<TerminalId, Instant>,
    grace_period: Duration,
    clock: Arc<dyn Clock>,
    observers: Arc<Mutex<ObserverRegistry>>,
}

impl AgentStateStore {
    pub fn new(clock: Arc<dyn Clock>, grace_period: Duration) -> Self {
        Self {
            connected: None,
            disconnected: HashMap::new(),
            last_disconnect: HashMap::new(),
            grace_period,
            clock,
            observers: Arc::new(Mutex::new(ObserverRegistry::default())),
        }
    }

    pub fn set_connected_agent(
        &mut self,
        terminal_id: &TerminalId,
        agent_type: AgentType,
        agent_name: Option<String>,
    ) -> ConnectOutcome {
        if let Some(current) = &self.connected {
            if &current.terminal_id == terminal_id && current.agent_type == agent_type {
                return ConnectOutcome::AlreadyConnected;
            }
        }

        let now = self.clock.now();
        if let Some(lost_at) = self.last_disconnect.get(terminal_id) {
            let elapsed = now.saturating_duration_since(*lost_at);
            if elapsed < self.grace_period {
                debug!(
                    terminal_id = %terminal_id,
                    agent = %agent_type,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "connect within grace period rejected"
                );
                return ConnectOutcome::RejectedGracePeriod;
            }
        }

        let mut changes = Vec::with_capacity(2);
        if let Some(previous) = self.connected.take() {
            if &previous.terminal_id != terminal_id {
                self.disconnected.insert(
                    previous.terminal_id.clone(),
                    DisconnectedAgent {
                        agent_type: previous.agent_type,
                        since: now,
                    },
                );
                self.last_disconnect.insert(previous.terminal_id.clone(), now);
                changes.push(AgentStatusChange {
                    terminal_id: previous.terminal_id,
                    status: AgentStatus::Disconnected,
                    agent_type: Some(previous.agent_type),
                });
            }
        }

        self.disconnected.remove(terminal_id);
        self.last_disconnect.remove(terminal_id);
        self.connected = Some(ConnectedAgent {
            terminal_id: terminal_id.clone(),
            agent_type,
            agent_name,
        });
        changes.push(AgentStatusChange {
            terminal_id: terminal_id.clone(),
            status: AgentStatus::Connected,
            agent_type: Some(agent_type),
        });

        info!(terminal_id = %terminal_id, agent = %agent_type, "agent connected");
        self.notify(&changes);
        ConnectOutcome::Connected
    }

    /// Manual reconnect that skips the grace-period check.
    pub fn force_reconnect_agent(
        &mut self,
        terminal_id: &TerminalId,
        agent_type: AgentType,
        agent_name: Option<String>,
    ) -> ConnectOutcome {
        self.last_disconnect.remove(terminal_id);
        self.set_connected_agent(terminal_id, agent_type, agent_name)
    }

    /// The agent in `terminal_id` went away. A vacated connected slot is
    /// handed to the most recently disconnected agent.
    pub fn set_agent_terminated(&mut self, terminal_id: &TerminalId) -> bool {
        let now = self.clock.now();
        let mut changes = Vec::with_capacity(2);

        let was_connected = self
            .connected
            .as_ref()
            .is_some_and(|current| &current.terminal_id == terminal_id);

        if was_connected {
            let previous = self.connected.take();
            changes.push(AgentStatusChange {
                terminal_id: terminal_id.clone(),
                status: AgentStatus::None,
                agent_type: previous.map(|agent| agent.agent_type),
            });
        } else if let Some(entry) = self.disconnected.remove(terminal_id) {
            changes.push(AgentStatusChange {
                terminal_id: terminal_id.clone(),
                status: AgentStatus::None,
                agent_type: Some(entry.agent_type),
            });
        } else {
            return false;
        }
        self.last_disconnect.insert(terminal_id.clone(), now);
        info!(terminal_id = %terminal_id, "agent terminated");

        if was_connected {
            changes.extend(self.promote_latest_disconnected());
        }
        self.notify(&changes);
        true
    }

    /// Erase every trace of a removed terminal.
    pub fn remove_terminal_completely(&mut self, terminal_id: &TerminalId) {
        self.last_disconnect.remove(terminal_id);
        let mut changes = Vec::with_capacity(2);

        let was_connected = self
            .connected
            .as_ref()
            .is_some_and(|current| &current.terminal_id == terminal_id);
        if was_connected {
            self.connected = None;
            changes.push(AgentStatusChange {
                terminal_id: terminal_id.clone(),
                status: AgentStatus::None,
                agent_type: None,
            });
            changes.extend(self.promote_latest_disconnected());
        } else if self.disconnected.remove(terminal_id).is_some() {
            changes.push(AgentStatusChange {
                terminal_id: terminal_id.clone(),
                status: AgentStatus::None,
                agent_type: None,
            });
        }

        if !changes.is_empty() {
            debug!(terminal_id = %terminal_id, "agent state removed with terminal");
            self.notify(&changes);
        }
    }

    pub fn get_connected_agent_terminal_id(&self) -> Option<&TerminalId> {
        self.connected.as_ref().map(|agent| &agent.terminal_id)
    }

    pub fn connected_agent(&self) -> Option<&ConnectedAgent> {
        self.connected.as_ref()
    }

    pub fn get_disconnected_agents(&self) -> &HashMap<TerminalId, DisconnectedAgent> {
        &self.disconnected
    }

    pub fn status_of(&self, terminal_id: &str) -> (AgentStatus, Option<AgentType>) {
        if let Some(agent) = self
            .connected
            .as_ref()
            .filter(|agent| agent.terminal_id.as_str() == terminal_id)
        {
            return (AgentStatus::Connected, Some(agent.agent_type));
        }
        match self.disconnected.get(terminal_id) {
            Some(entry) => (AgentStatus::Disconnected, Some(entry.agent_type)),
            None => (AgentStatus::None, None),
        }
    }

    /// Holds whenever control is outside this store.
    pub fn invariant_holds(&self) -> bool {
        self.connected
            .as_ref()
            .map_or(true, |agent| !self.disconnected.contains_key(&agent.terminal_id))
    }

    pub fn subscribe(&self, observer: impl Fn(&AgentStatusChange) + Send + Sync + 'static) -> AgentSubscription {
        let mut registry = self.observers.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.observers.push((id, Arc::new(observer)));
        AgentSubscription {
            id,
            registry: Arc::downgrade(&self.observers),
        }
    }

    pub fn dispose(&mut self) {
        self.connected = None;
        self.disconnected.clear();
        self.last_disconnect.clear();
        self.observers.lock().observers.clear();
    }

    fn promote_latest_disconnected(&mut self) -> Option<AgentStatusChange> {
        let (terminal_id, entry) = self
            .disconnected
            .iter()
            .max_by_key(|(_, entry)| entry.since)
            .map(|(id, entry)| (id.clone(), entry.clone()))?;

        self.disconnected.remove(&terminal_id);
        self.last_disconnect.remove(&terminal_id);
        self.connected = Some(ConnectedAgent {
            terminal_id: terminal_id.clone(),
            agent_type: entry.agent_type,
            agent_name: None,
        });
        info!(terminal_id = %terminal_id, agent = %entry.agent_type, "disconnected agent promoted");
        Some(AgentStatusChange {
            terminal_id,
            status: AgentStatus::Connected,
            agent_type: Some(entry.agent_type),
        })
    }

    fn notify(&self, changes: &[AgentStatusChange]) {
        let observers: Vec<AgentObserver> = self
            .observers
            .lock()
            .observers
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for change in changes {
            for observer in &observers {
                if catch_unwind(AssertUnwindSafe(|| observer(change))).is_err() {
                    error!(terminal_id = %change.terminal_id, "agent status observer panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> (ManualScheduler, AgentStateStore) {
        let clock = ManualScheduler::new();
        let store = AgentStateStore::new(Arc::new(clock.clone()), Duration::from_millis(2000));
        (clock, store)
    }

    fn id(value: &str) -> TerminalId {
        TerminalId::new(value)
    }

    #[test]
    fn connecting_new_terminal_demotes_previous() {
        let (_clock, mut store) = store();
        store.set_connected_agent(&id("t1"), AgentType::Claude, None);
        store.set_connected_agent(&id("t2"), AgentType::Gemini, Some("gemini".into()));

        assert_eq!(store.get_connected_agent_terminal_id(), Some(&id("t2")));
        assert_eq!(store.get_disconnected_agents()[&id("t1")].agent_type, AgentType::Claude);
        assert!(store.invariant_holds());
    }

    #[test]
    fn same_terminal_same_type_is_idempotent() {
        let (_clock, mut store) = store();
        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        let _sub = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(store.set_connected_agent(&id("t"), AgentType::Claude, None), ConnectOutcome::Connected);
        assert_eq!(
            store.set_connected_agent(&id("t"), AgentType::Claude, None),
            ConnectOutcome::AlreadyConnected
        );
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reconnect_within_grace_period_is_rejected() {
        let (clock, mut store) = store();
        let t = id("t");
        store.set_connected_agent(&t, AgentType::Claude, None);
        store.set_connected_agent(&id("other"), AgentType::Gemini, None);

        clock.advance(Duration::from_millis(1000));
        assert_eq!(
            store.set_connected_agent(&t, AgentType::Claude, None),
            ConnectOutcome::RejectedGracePeriod
        );
        assert_eq!(store.get_connected_agent_terminal_id(), Some(&id("other")));

        clock.advance(Duration::from_millis(1500));
        assert_eq!(store.set_connected_agent(&t, AgentType::Claude, None), ConnectOutcome::Connected);
        assert_eq!(store.get_connected_agent_terminal_id(), Some(&t));
        assert!(store.invariant_holds());
    }

    #[test]
    fn force_reconnect_skips_grace_period() {
        let (_clock, mut store) = store();
        let t = id("t");
        store.set_connected_agent(&t, AgentType::Claude, None);
        store.set_agent_terminated(&t);
        assert_eq!(
            store.force_reconnect_agent(&t, AgentType::Claude, None),
            ConnectOutcome::Connected
        );
    }

    #[test]
    fn terminating_connected_promotes_latest_disconnected() {
        let (clock, mut store) = store();
        store.set_connected_agent(&id("t2"), AgentType::Gemini, None);
        clock.advance(Duration::from_secs(5));
        store.set_connected_agent(&id("t3"), AgentType::Gemini, None);
        clock.advance(Duration::from_secs(5));
        store.set_connected_agent(&id("t1"), AgentType::Claude, None);

        assert!(store.set_agent_terminated(&id("t1")));

        assert_eq!(store.get_connected_agent_terminal_id(), Some(&id("t3")));
        let disconnected: Vec<_> = store.get_disconnected_agents().keys().cloned().collect();
        assert_eq!(disconnected, vec![id("t2")]);
        assert!(store.invariant_holds());
    }

    #[test]
    fn terminating_disconnected_only_removes_it() {
        let (_clock, mut store) = store();
        store.set_connected_agent(&id("a"), AgentType::Claude, None);
        store.set_connected_agent(&id("b"), AgentType::Codex, None);

        assert!(store.set_agent_terminated(&id("a")));
        assert!(store.get_disconnected_agents().is_empty());
        assert_eq!(store.get_connected_agent_terminal_id(), Some(&id("b")));
        assert!(!store.set_agent_terminated(&id("unknown")));
    }

    #[test]
    fn remove_terminal_completely_erases_and_promotes() {
        let (_clock, mut store) = store();
        store.set_connected_agent(&id("a"), AgentType::Claude, None);
        store.set_connected_agent(&id("b"), AgentType::Gemini, None);
        store.remove_terminal_completely(&id("b"));

        assert_eq!(store.get_connected_agent_terminal_id(), Some(&id("a")));
        store.remove_terminal_completely(&id("a"));
        assert_eq!(store.get_connected_agent_terminal_id(), None);
        assert_eq!(store.status_of("a"), (AgentStatus::None, None));
    }

    #[test]
    fn invariant_holds_across_mixed_sequence() {
        let (clock, mut store) = store();
        let ids: Vec<TerminalId> = (0..4).map(|n| id(&format!("t{n}"))).collect();
        for round in 0..24usize {
            let target = &ids[round % ids.len()];
            match round % 3 {
                0 => {
                    store.set_connected_agent(target, AgentType::Claude, None);
                }
                1 => {
                    store.set_agent_terminated(target);
                }
                _ => store.remove_terminal_completely(&ids[(round * 7) % ids.len()]),
            }
            clock.advance(Duration::from_millis(700));
            assert!(store.invariant_holds(), "round {round}");
        }
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        let (_clock, mut store) = store();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _bad = store.subscribe(|_| panic!("observer failure"));
        let _good = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set_connected_agent(&id("a"), AgentType::Claude, None);
        store.set_connected_agent(&id("b"), AgentType::Claude, None);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let (_clock, mut store) = store();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sub = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();

        store.set_connected_agent(&id("a"), AgentType::Claude, None);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
