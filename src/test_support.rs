//! In-process fakes for the host's collaborators, shared by unit and
//! integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bridge::{HostMessage, Transport, UiMessage};
use crate::config::HostSettings;
use crate::error::{Error, Result};
use crate::host::{Host, HostDeps, HostEvent};
use crate::persistence::{MemorySessionStore, SessionPersistence};
use crate::scheduler::ManualScheduler;
use crate::terminal::{PtyEvent, PtyEventSink, PtyHandle, PtySpawner, SpawnRequest, SpawnedPty, TerminalId};

#[derive(Debug, Default)]
struct FakePtyState {
    written: String,
    resizes: Vec<(u16, u16)>,
    killed: bool,
}

/// PTY that records what the host does to it. Clones observe the same PTY.
#[derive(Debug, Clone, Default)]
pub struct FakePty {
    state: Arc<Mutex<FakePtyState>>,
}

impl FakePty {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed() -> Box<dyn PtyHandle> {
        Box::new(Self::new())
    }

    pub fn written(&self) -> String {
        self.state.lock().written.clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.state.lock().resizes.clone()
    }

    pub fn is_killed(&self) -> bool {
        self.state.lock().killed
    }
}

impl PtyHandle for FakePty {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.killed {
            return Err(Error::Pty("process killed".into()));
        }
        state.written.push_str(&String::from_utf8_lossy(data));
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.state.lock().resizes.push((cols, rows));
        Ok(())
    }

    fn kill(&mut self) {
        self.state.lock().killed = true;
    }
}

#[derive(Default)]
struct SpawnerState {
    ptys: HashMap<TerminalId, FakePty>,
    requests: Vec<SpawnRequest>,
    failures_remaining: usize,
}

/// Spawner handing out [`FakePty`]s. Output is injected by the test as
/// `PtyEvent`s, so the sink is not retained.
#[derive(Clone)]
pub struct FakeSpawner {
    state: Arc<Mutex<SpawnerState>>,
    shell: Option<String>,
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::with_shell(Some("bash"))
    }

    pub fn with_shell(shell: Option<&str>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SpawnerState::default())),
            shell: shell.map(str::to_string),
        }
    }

    /// Fail the next `count` spawns.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().failures_remaining = count;
    }

    pub fn pty(&self, id: &str) -> Option<FakePty> {
        self.state.lock().ptys.get(id).cloned()
    }

    pub fn spawned_ids(&self) -> Vec<TerminalId> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|request| request.terminal_id.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.state.lock().requests.clone()
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(&self, request: SpawnRequest, _sink: PtyEventSink) -> Result<SpawnedPty> {
        let mut state = self.state.lock();
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(Error::Pty("spawn refused".into()));
        }
        let pty = FakePty::new();
        state.ptys.insert(request.terminal_id.clone(), pty.clone());
        state.requests.push(request);
        Ok(SpawnedPty {
            handle: Box::new(pty),
            shell: self.shell.clone(),
        })
    }
}

#[derive(Default)]
struct TransportState {
    messages: Vec<HostMessage>,
    failure: Option<String>,
}

/// Transport that keeps every delivered message. Clones share the log.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    state: Arc<Mutex<TransportState>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every post fails with `Error::Transport(message)`.
    pub fn failing(message: &str) -> Self {
        let transport = Self::new();
        transport.state.lock().failure = Some(message.to_string());
        transport
    }

    pub fn messages(&self) -> Vec<HostMessage> {
        self.state.lock().messages.clone()
    }

    pub fn commands(&self) -> Vec<&'static str> {
        self.state
            .lock()
            .messages
            .iter()
            .map(HostMessage::command)
            .collect()
    }

    pub fn take(&self) -> Vec<HostMessage> {
        std::mem::take(&mut self.state.lock().messages)
    }
}

impl Transport for RecordingTransport {
    fn post(&mut self, message: &HostMessage) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(failure) = &state.failure {
            return Err(Error::Transport(failure.clone()));
        }
        state.messages.push(message.clone());
        Ok(())
    }
}

/// A [`Host`] wired to fakes and a virtual clock, driven event by event.
pub struct HostHarness {
    pub host: Host,
    pub scheduler: ManualScheduler,
    pub spawner: FakeSpawner,
    pub transport: RecordingTransport,
    pub store: MemorySessionStore,
}

impl HostHarness {
    pub fn new(settings: HostSettings) -> Self {
        Self::with_store(settings, MemorySessionStore::new())
    }

    pub fn with_store(settings: HostSettings, store: MemorySessionStore) -> Self {
        let scheduler = ManualScheduler::new();
        let spawner = FakeSpawner::new();
        let persistence = SessionPersistence::new(Box::new(store.clone()), settings.persistence.clone());
        let deps = HostDeps::new(
            settings,
            Arc::new(spawner.clone()),
            Arc::new(scheduler.clone()),
            Arc::new(scheduler.clone()),
            Arc::new(|_: PtyEvent| {}),
        )
        .with_persistence(persistence);

        Self {
            host: Host::new(deps),
            scheduler,
            spawner,
            transport: RecordingTransport::new(),
            store,
        }
    }

    /// Attached, both handshake steps done, default terminals announced.
    pub fn started() -> Self {
        let mut harness = Self::new(HostSettings::default());
        harness.connect();
        harness.ui(UiMessage::WebviewReady);
        harness.ui(UiMessage::WebviewInitialized);
        harness
    }

    pub fn connect(&mut self) {
        self.host
            .handle_event(HostEvent::TransportAttached(Box::new(self.transport.clone())));
    }

    pub fn ui(&mut self, message: UiMessage) {
        self.host.handle_event(HostEvent::Ui(message));
    }

    pub fn ack(&mut self, id: &TerminalId) {
        self.ui(UiMessage::TerminalInitializationComplete {
            terminal_id: id.clone(),
        });
    }

    pub fn pty_data(&mut self, id: &TerminalId, data: &str) {
        self.host.handle_event(HostEvent::Pty(PtyEvent::Data {
            terminal_id: id.clone(),
            data: data.to_string(),
        }));
    }

    /// Move virtual time and deliver every timer that came due.
    pub fn advance(&mut self, by: Duration) -> usize {
        let due = self.scheduler.advance(by);
        let fired = due.len();
        for key in due {
            self.host.handle_event(HostEvent::Timer(key));
        }
        fired
    }

    /// Host ids ordered by slot number.
    pub fn terminal_ids(&self) -> Vec<TerminalId> {
        self.host
            .registry()
            .list()
            .into_iter()
            .map(|session| session.id.clone())
            .collect()
    }
}
