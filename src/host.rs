//! The host event loop
//!
//! [`Host`] owns every piece of terminal state and is driven by a single
//! stream of [`HostEvent`]s: UI messages, PTY output and exits, watchdog
//! timer firings, and transport attach/detach. Each event is handled to
//! completion before the next one is looked at, so no two handlers ever
//! interleave.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::agent::{
    AgentDetector, AgentSignalKind, AgentStateStore, AgentSubscription, PatternAgentDetector,
};
use crate::bridge::{
    AgentTerminalState, CommandRouter, HostMessage, MessageBridge, NotificationLevel, Transport, UiMessage,
};
use crate::config::HostSettings;
use crate::constants::{DEFAULT_COLS, DEFAULT_ROWS};
use crate::error::{Error, Result};
use crate::init::{
    InitializationState, InitializationStateMachine, InitializationWatchdog, TransitionOutcome, WatchdogFiring,
};
use crate::orchestrator::{OrchestrationFailure, OrchestrationPhase, SessionOrchestrator};
use crate::output::{OutputRouter, Routed};
use crate::persistence::{PersistedTerminal, SessionPersistence, SessionSnapshot};
use crate::scheduler::{Clock, Scheduler, TimerKey, WatchdogPhase};
use crate::telemetry::{HostMetrics, MetricsSnapshot, TelemetryEvent, TelemetrySink, TracingTelemetry};
use crate::terminal::shell::{contains_prompt, contains_prompt_marker, integration_command};
use crate::terminal::{
    NewTerminal, PtyEvent, PtyEventSink, PtySpawner, ScrollbackBuffer, SpawnRequest, TerminalId, TerminalInfo,
    TerminalRegistry,
};
use crate::util::now_millis;

// Chars of earlier output kept so a prompt mark split across reads is seen.
const PROMPT_CARRY_CHARS: usize = 8;

pub enum HostEvent {
    Ui(UiMessage),
    Pty(PtyEvent),
    Timer(TimerKey),
    TransportAttached(Box<dyn Transport>),
    TransportDetached,
    Shutdown,
}

impl fmt::Debug for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostEvent::Ui(message) => f.debug_tuple("Ui").field(message).finish(),
            HostEvent::Pty(event) => f.debug_tuple("Pty").field(event).finish(),
            HostEvent::Timer(key) => f.debug_tuple("Timer").field(key).finish(),
            HostEvent::TransportAttached(_) => f.write_str("TransportAttached"),
            HostEvent::TransportDetached => f.write_str("TransportDetached"),
            HostEvent::Shutdown => f.write_str("Shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostControl {
    Continue,
    Exit,
}

/// PTY sink that forwards into the host channel.
pub fn pty_event_sink(tx: mpsc::UnboundedSender<HostEvent>) -> PtyEventSink {
    Arc::new(move |event| {
        if tx.send(HostEvent::Pty(event)).is_err() {
            debug!("host loop gone, PTY event dropped");
        }
    })
}

/// Collaborators the host is built from.
pub struct HostDeps {
    pub settings: HostSettings,
    pub spawner: Arc<dyn PtySpawner>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub pty_events: PtyEventSink,
    pub persistence: Option<SessionPersistence>,
    pub detector: Box<dyn AgentDetector>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl HostDeps {
    pub fn new(
        settings: HostSettings,
        spawner: Arc<dyn PtySpawner>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        pty_events: PtyEventSink,
    ) -> Self {
        Self {
            settings,
            spawner,
            scheduler,
            clock,
            pty_events,
            persistence: None,
            detector: Box::new(PatternAgentDetector::new()),
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    pub fn with_persistence(mut self, persistence: SessionPersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_detector(mut self, detector: Box<dyn AgentDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Reuse a known host id (restoration); otherwise one is generated
    pub id: Option<TerminalId>,
    /// Id the UI already uses for this terminal
    pub ui_id: Option<TerminalId>,
    pub cwd: Option<PathBuf>,
    pub name: Option<String>,
    pub activate: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            id: None,
            ui_id: None,
            cwd: None,
            name: None,
            activate: true,
        }
    }
}

pub struct Host {
    settings: HostSettings,
    spawner: Arc<dyn PtySpawner>,
    pty_events: PtyEventSink,
    registry: TerminalRegistry,
    init: InitializationStateMachine,
    watchdog: InitializationWatchdog,
    output: OutputRouter,
    agents: AgentStateStore,
    agents_dirty: Arc<AtomicBool>,
    _agent_subscription: AgentSubscription,
    detector: Box<dyn AgentDetector>,
    bridge: MessageBridge,
    router: CommandRouter,
    orchestrator: SessionOrchestrator,
    persistence: Option<SessionPersistence>,
    scrollback: HashMap<TerminalId, ScrollbackBuffer>,
    safe_mode: HashSet<TerminalId>,
    /// Terminals past their first ack whose surface the current UI has not
    /// confirmed yet. Their output is buffered until it does.
    unconfirmed_surfaces: HashSet<TerminalId>,
    prompt_carry: HashMap<TerminalId, String>,
    telemetry: Arc<dyn TelemetrySink>,
    metrics: HostMetrics,
    shutting_down: bool,
}

impl Host {
    pub fn new(deps: HostDeps) -> Self {
        let settings = deps.settings.normalized();
        let agents = AgentStateStore::new(deps.clock.clone(), settings.agent_grace_period());
        let agents_dirty = Arc::new(AtomicBool::new(false));
        let dirty = agents_dirty.clone();
        let agent_subscription = agents.subscribe(move |_| dirty.store(true, Ordering::SeqCst));

        Self {
            registry: TerminalRegistry::new(settings.min_terminals, settings.max_terminals),
            init: InitializationStateMachine::new(deps.clock.clone()),
            watchdog: InitializationWatchdog::new(deps.scheduler),
            output: OutputRouter::new(settings.output_buffer_limit_bytes),
            agents,
            agents_dirty,
            _agent_subscription: agent_subscription,
            detector: deps.detector,
            bridge: MessageBridge::new(settings.pending_queue_limit),
            router: CommandRouter::new(),
            orchestrator: SessionOrchestrator::new(deps.clock),
            persistence: deps.persistence,
            scrollback: HashMap::new(),
            safe_mode: HashSet::new(),
            unconfirmed_surfaces: HashSet::new(),
            prompt_carry: HashMap::new(),
            telemetry: deps.telemetry,
            metrics: HostMetrics::default(),
            shutting_down: false,
            spawner: deps.spawner,
            pty_events: deps.pty_events,
            settings,
        }
    }

    /// Drain `events` until shutdown or until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<HostEvent>) {
        info!("host loop started");
        while let Some(event) = events.recv().await {
            if self.handle_event(event) == HostControl::Exit {
                break;
            }
        }
        self.shutdown();
        info!("host loop stopped");
    }

    pub fn handle_event(&mut self, event: HostEvent) -> HostControl {
        let control = match event {
            HostEvent::Ui(message) => {
                if let Some(message) = self.router.route(message) {
                    self.handle_ui(message);
                }
                HostControl::Continue
            }
            HostEvent::Pty(PtyEvent::Data { terminal_id, data }) => {
                self.on_pty_data(&terminal_id, data);
                HostControl::Continue
            }
            HostEvent::Pty(PtyEvent::Exit { terminal_id, exit_code }) => {
                self.on_pty_exit(&terminal_id, exit_code);
                HostControl::Continue
            }
            HostEvent::Timer(key) => {
                self.on_timer(&key);
                HostControl::Continue
            }
            HostEvent::TransportAttached(transport) => {
                self.attach_transport(transport);
                HostControl::Continue
            }
            HostEvent::TransportDetached => {
                self.detach_transport();
                HostControl::Continue
            }
            HostEvent::Shutdown => {
                self.shutdown();
                HostControl::Exit
            }
        };
        self.flush_agent_sync();
        control
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    pub fn registry(&self) -> &TerminalRegistry {
        &self.registry
    }

    pub fn initialization_state(&self, id: &str) -> Option<InitializationState> {
        self.init.get_state(id)
    }

    pub fn agents(&self) -> &AgentStateStore {
        &self.agents
    }

    pub fn is_bridge_ready(&self) -> bool {
        self.bridge.is_ready()
    }

    pub fn orchestration_phase(&self) -> OrchestrationPhase {
        self.orchestrator.phase()
    }

    pub fn orchestration_failure(&self) -> Option<&OrchestrationFailure> {
        self.orchestrator.failure()
    }

    pub fn pending_output_bytes(&self, id: &str) -> usize {
        self.output.pending_bytes(id)
    }

    pub fn is_safe_mode(&self, id: &str) -> bool {
        self.safe_mode.contains(id)
    }

    /// Whether PTY output for `id` currently reaches the UI.
    pub fn is_output_open(&self, id: &str) -> bool {
        self.init.is_output_allowed(id) && !self.unconfirmed_surfaces.contains(id)
    }

    pub fn is_watchdog_armed(&self, id: &TerminalId, phase: WatchdogPhase) -> bool {
        self.watchdog.is_armed(id, phase)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// UI id the given host terminal is announced under.
    pub fn ui_id(&self, id: &TerminalId) -> TerminalId {
        self.output.ui_id(id)
    }

    fn handle_ui(&mut self, message: UiMessage) {
        match message {
            UiMessage::WebviewReady => {
                self.bridge.mark_ready();
                self.bridge.send(HostMessage::ExtensionReady { timestamp: now_millis() });
            }
            UiMessage::WebviewInitialized => self.on_webview_initialized(),
            UiMessage::TerminalInitializationComplete { terminal_id } => {
                self.on_view_ack(&terminal_id, "terminalInitializationComplete")
            }
            UiMessage::TerminalReady { terminal_id } => self.on_view_ack(&terminal_id, "terminalReady"),
            UiMessage::Input { terminal_id, data } => {
                let id = self.output.host_id(&terminal_id);
                if let Err(err) = self.registry.write(&id, data.as_bytes()) {
                    warn!(terminal_id = %id, error = %err, "input not delivered");
                }
            }
            UiMessage::Resize { terminal_id, cols, rows } => {
                let id = self.output.host_id(&terminal_id);
                if let Err(err) = self.registry.resize(&id, cols, rows) {
                    warn!(terminal_id = %id, error = %err, "resize failed");
                }
            }
            UiMessage::CreateTerminal { ui_id, cwd, name } => {
                let options = CreateOptions {
                    ui_id,
                    cwd: cwd.map(PathBuf::from),
                    name,
                    ..CreateOptions::default()
                };
                match self.create_terminal(options) {
                    Ok(_) => self.save_session(),
                    Err(Error::TerminalLimit { max }) => {
                        self.notify(NotificationLevel::Warning, format!("Maximum of {max} terminals reached"))
                    }
                    Err(err) => {
                        error!(error = %err, "terminal creation failed");
                        self.notify(NotificationLevel::Error, format!("Failed to create terminal: {err}"));
                    }
                }
            }
            UiMessage::DeleteTerminal { terminal_id } => {
                let id = self.output.host_id(&terminal_id);
                match self.remove_terminal(&id, false, "deleted by user") {
                    Ok(()) => self.save_session(),
                    Err(Error::MinimumTerminals { min }) => self.notify(
                        NotificationLevel::Warning,
                        format!("At least {min} terminal(s) must stay open"),
                    ),
                    Err(err) => warn!(terminal_id = %id, error = %err, "delete failed"),
                }
            }
            UiMessage::FocusTerminal { terminal_id } => {
                let id = self.output.host_id(&terminal_id);
                match self.registry.set_active(&id) {
                    Ok(()) => self.save_session(),
                    Err(err) => warn!(terminal_id = %id, error = %err, "focus failed"),
                }
            }
            UiMessage::RequestStateSync => self.send_agent_state_sync(),
        }
    }

    fn attach_transport(&mut self, transport: Box<dyn Transport>) {
        info!("UI transport attached");
        self.orchestrator.restart();
        let attached = self.run_phase(OrchestrationPhase::WebviewSetup, |host| {
            host.bridge.set_transport(Some(transport));
            host.bridge.send(HostMessage::Version {
                version: env!("CARGO_PKG_VERSION").to_string(),
            });
            Ok(())
        });
        if attached.is_none() {
            return;
        }

        let replay = self
            .run_phase(OrchestrationPhase::MessageHandlers, |host| Ok(host.router.register_all()))
            .unwrap_or_default();
        for message in replay {
            self.handle_ui(message);
        }
    }

    fn detach_transport(&mut self) {
        info!("UI transport detached");
        self.bridge.set_transport(None);
        self.router.unregister_all();
        for info in self.registry.infos() {
            self.watchdog.stop(&info.id, WatchdogPhase::Ack, "transport detached");
            let acked = self
                .init
                .get_state(&info.id)
                .is_some_and(|state| state >= InitializationState::ViewReady);
            if acked {
                self.unconfirmed_surfaces.insert(info.id);
            }
        }
    }

    fn on_webview_initialized(&mut self) {
        if self.orchestrator.is_completed() {
            debug!("webviewInitialized after setup, re-announcing terminals");
            self.reannounce_terminals();
            return;
        }

        let Some(terminal_count) = self.run_phase(OrchestrationPhase::TerminalSetup, |host| {
            host.bridge.send(HostMessage::Settings {
                settings: host.settings.clone(),
            });
            host.setup_terminals()
        }) else {
            return;
        };

        let services = self.run_phase(OrchestrationPhase::ServicesReady, |host| {
            host.send_agent_state_sync();
            Ok(())
        });
        if services.is_none() {
            return;
        }

        let total = self.orchestrator.complete();
        self.telemetry.record(TelemetryEvent::OrchestrationCompleted {
            duration_ms: total.as_millis() as u64,
            terminal_count,
        });
        self.bridge.send(HostMessage::InitializationComplete {
            terminal_count,
            timestamp: now_millis(),
        });
    }

    fn run_phase<T>(&mut self, phase: OrchestrationPhase, work: impl FnOnce(&mut Self) -> Result<T>) -> Option<T> {
        let start = match self.orchestrator.begin(phase) {
            Ok(start) => start,
            Err(failure) => {
                debug!(phase = %phase, error = %failure, "phase not started");
                return None;
            }
        };
        let result = work(self);
        match self.orchestrator.finish(start, result) {
            Ok(value) => Some(value),
            Err(failure) => {
                self.telemetry.record(TelemetryEvent::OrchestrationFailed {
                    phase: failure.phase.to_string(),
                    duration_ms: failure.duration_ms,
                    error: failure.error.clone(),
                });
                self.notify(
                    NotificationLevel::Error,
                    format!("Terminal host failed to initialize: {failure}"),
                );
                None
            }
        }
    }

    /// Restore the previous session, else create the default set. Falls
    /// back to a single terminal in the home directory as a last resort.
    fn setup_terminals(&mut self) -> Result<usize> {
        if !self.registry.is_empty() {
            for info in self.registry.infos() {
                self.announce_terminal(&info);
            }
            return Ok(self.registry.len());
        }

        let restored = self.restore_session();
        if restored == 0 {
            let wanted = self.settings.default_terminal_count.max(1);
            for _ in 0..wanted {
                if let Err(err) = self.create_terminal(CreateOptions::default()) {
                    warn!(error = %err, "default terminal creation failed");
                }
            }
        }

        if self.registry.is_empty() {
            warn!("no terminal could be created, trying emergency terminal");
            let emergency = CreateOptions {
                cwd: dirs::home_dir(),
                ..CreateOptions::default()
            };
            self.create_terminal(emergency)
                .map_err(|err| Error::Orchestration(format!("could not create any terminal: {err}")))?;
        }

        self.save_session();
        Ok(self.registry.len())
    }

    fn restore_session(&mut self) -> usize {
        let Some(persistence) = self.persistence.as_mut() else {
            return 0;
        };
        let snapshot = match persistence.restore() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return 0,
            Err(err) => {
                error!(error = %err, "session restore failed");
                self.notify(
                    NotificationLevel::Warning,
                    format!("Previous terminal session could not be restored: {err}"),
                );
                return 0;
            }
        };

        let mut restored = 0;
        for terminal in snapshot.terminals {
            let options = CreateOptions {
                id: Some(terminal.id.clone()),
                ui_id: None,
                cwd: Some(PathBuf::from(&terminal.cwd)),
                name: Some(terminal.name),
                activate: terminal.is_active,
            };
            match self.create_terminal(options) {
                Ok(info) => {
                    restored += 1;
                    if !terminal.scrollback.is_empty() {
                        let mut replay = terminal.scrollback.join("\r\n");
                        replay.push_str("\r\n");
                        self.output.buffer(&info.id, replay);
                    }
                    if let Some(buffer) = self.scrollback.get_mut(&info.id) {
                        buffer.restore(terminal.scrollback);
                    }
                }
                Err(err) => warn!(terminal_id = %terminal.id, error = %err, "terminal not restored"),
            }
        }

        if let Some(active) = snapshot.active_terminal_id {
            if self.registry.contains(&active) {
                if let Err(err) = self.registry.set_active(&active) {
                    warn!(terminal_id = %active, error = %err, "restored active terminal not focused");
                }
            }
        }
        info!(restored, "session restored");
        restored
    }

    pub fn create_terminal(&mut self, options: CreateOptions) -> Result<TerminalInfo> {
        if !self.registry.can_create() {
            return Err(Error::TerminalLimit {
                max: self.registry.max_terminals(),
            });
        }

        let id = options.id.unwrap_or_else(TerminalId::generate);
        let cwd = self.resolve_cwd(options.cwd);
        let mut env = HashMap::new();
        if let Some(workspace) = &self.settings.workspace_path {
            env.insert("TERMDECK_WORKSPACE".to_string(), workspace.to_string_lossy().to_string());
        }

        let spawned = self.spawner.spawn(
            SpawnRequest {
                terminal_id: id.clone(),
                cwd: cwd.clone(),
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
                env,
            },
            self.pty_events.clone(),
        )?;

        let info = self.registry.create(
            NewTerminal {
                id: id.clone(),
                name: options.name,
                cwd,
                shell: spawned.shell,
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
                activate: options.activate,
            },
            spawned.handle,
        )?;

        self.init.register(&id);
        let lines = self
            .persistence
            .as_ref()
            .map_or(self.settings.persistence.scrollback_lines, SessionPersistence::scrollback_lines);
        self.scrollback.insert(id.clone(), ScrollbackBuffer::new(lines));
        if let Some(ui_id) = &options.ui_id {
            self.output.map_ids(&id, ui_id);
        }
        self.metrics.terminal_created();
        self.announce_terminal(&info);
        Ok(info)
    }

    /// Send `terminalCreated` and, unless the UI already acknowledged this
    /// terminal, wait for its ack under the watchdog.
    fn announce_terminal(&mut self, info: &TerminalInfo) {
        let ui_info = TerminalInfo {
            id: self.output.ui_id(&info.id),
            ..info.clone()
        };
        self.init.mark_view_pending(&info.id, "terminalCreated sent");
        self.bridge.send(HostMessage::TerminalCreated(ui_info));

        let awaiting_ack = self.unconfirmed_surfaces.contains(&info.id)
            || self
                .init
                .get_state(&info.id)
                .is_some_and(|state| state < InitializationState::ViewReady);
        if awaiting_ack {
            self.watchdog.start(&info.id, WatchdogPhase::Ack, self.settings.ack_watchdog);
        }
    }

    fn reannounce_terminals(&mut self) {
        let infos = self.registry.infos();
        for info in &infos {
            self.announce_terminal(info);
        }
        self.send_agent_state_sync();
        self.bridge.send(HostMessage::InitializationComplete {
            terminal_count: infos.len(),
            timestamp: now_millis(),
        });
    }

    fn on_view_ack(&mut self, ui_id: &TerminalId, context: &str) {
        let id = self.output.host_id(ui_id);
        if !self.registry.contains(&id) {
            debug!(terminal_id = %ui_id, context, "ack for unknown terminal ignored");
            return;
        }

        match self.init.mark_view_ready(&id, context) {
            TransitionOutcome::Applied { .. } => {}
            TransitionOutcome::Duplicate | TransitionOutcome::Regression { .. } => {
                if self.unconfirmed_surfaces.contains(&id) {
                    self.watchdog.stop(&id, WatchdogPhase::Ack, context);
                    self.confirm_surface(&id);
                    return;
                }
                // A re-created UI surface for a terminal that already streams
                if self.init.is_output_allowed(&id) {
                    self.bridge.send(HostMessage::StartOutput {
                        terminal_id: ui_id.clone(),
                        timestamp: now_millis(),
                    });
                }
                return;
            }
            TransitionOutcome::UnknownTerminal => return,
        }

        self.watchdog.stop(&id, WatchdogPhase::Ack, context);
        self.begin_shell_initialization(&id);
    }

    /// ViewReady → PtySpawned → ShellInitializing → ShellInitialized →
    /// OutputStreaming, arming the prompt watchdog on the way.
    fn begin_shell_initialization(&mut self, id: &TerminalId) {
        self.init.mark_pty_spawned(id, "pty attached");
        let safe_mode = self.safe_mode.contains(id);
        self.init.mark_shell_initializing(
            id,
            if safe_mode { "safe mode" } else { "shell integration" },
        );
        self.write_integration(id, safe_mode);
        self.watchdog.start(id, WatchdogPhase::Prompt, self.settings.prompt_watchdog);
        self.init.mark_shell_initialized(id, "integration written");
        self.start_output(id);
    }

    fn write_integration(&mut self, id: &TerminalId, safe_mode: bool) {
        let shell = self.registry.get(id).and_then(|session| session.shell.clone());
        let command = integration_command(shell.as_deref(), safe_mode);
        if let Err(err) = self.registry.write(id, command.as_bytes()) {
            warn!(terminal_id = %id, error = %err, "shell integration write failed");
        }
    }

    fn start_output(&mut self, id: &TerminalId) {
        let ui_id = self.output.ui_id(id);
        self.bridge.send(HostMessage::StartOutput {
            terminal_id: ui_id,
            timestamp: now_millis(),
        });
        self.init.mark_output_streaming(id, "startOutput sent");
        if let Some(frame) = self.output.flush_buffered_output(id) {
            self.bridge.send(HostMessage::Output {
                terminal_id: frame.terminal_id,
                data: frame.data,
            });
        }
    }

    /// A reconnected UI has the surface again: resume streaming, flushing
    /// whatever piled up while it was away.
    fn confirm_surface(&mut self, id: &TerminalId) {
        if !self.unconfirmed_surfaces.remove(id) || !self.init.is_output_allowed(id) {
            return;
        }
        let ui_id = self.output.ui_id(id);
        self.bridge.send(HostMessage::StartOutput {
            terminal_id: ui_id,
            timestamp: now_millis(),
        });
        if let Some(frame) = self.output.flush_buffered_output(id) {
            self.bridge.send(HostMessage::Output {
                terminal_id: frame.terminal_id,
                data: frame.data,
            });
        }
    }

    fn on_pty_data(&mut self, id: &TerminalId, data: String) {
        if !self.registry.contains(id) {
            debug!(terminal_id = %id, bytes = data.len(), "output for removed terminal dropped");
            return;
        }
        self.metrics.output(data.len());
        if let Some(buffer) = self.scrollback.get_mut(id) {
            buffer.append(&data);
        }
        self.detect_prompt(id, &data);
        self.detect_agents(id, &data);

        let gate_open = self.is_output_open(id);
        match self.output.on_data(id, data, gate_open) {
            Routed::Forwarded(frame) => self.bridge.send(HostMessage::Output {
                terminal_id: frame.terminal_id,
                data: frame.data,
            }),
            Routed::Buffered { pending_bytes } => {
                debug!(terminal_id = %id, pending_bytes, "output buffered until terminal is ready")
            }
        }
    }

    fn detect_prompt(&mut self, id: &TerminalId, data: &str) {
        let awaiting_prompt = self.init.get_state(id).is_some_and(|state| {
            state >= InitializationState::ShellInitializing && state < InitializationState::PromptReady
        });
        if !awaiting_prompt {
            return;
        }

        let mut joined = self.prompt_carry.remove(id).unwrap_or_default();
        joined.push_str(data);
        if !contains_prompt(data) && !contains_prompt_marker(&joined) {
            let count = joined.chars().count();
            let tail: String = joined.chars().skip(count.saturating_sub(PROMPT_CARRY_CHARS)).collect();
            self.prompt_carry.insert(id.clone(), tail);
            return;
        }
        self.init.mark_prompt_ready(id, "prompt detected");
        self.watchdog.stop(id, WatchdogPhase::Prompt, "prompt detected");
    }

    fn detect_agents(&mut self, id: &TerminalId, data: &str) {
        for signal in self.detector.detect(id, data) {
            match signal.kind {
                AgentSignalKind::Connected => {
                    let outcome =
                        self.agents
                            .set_connected_agent(id, signal.agent_type, Some(signal.agent_type.to_string()));
                    debug!(terminal_id = %id, agent = %signal.agent_type, ?outcome, "agent connect signal");
                }
                AgentSignalKind::Terminated => {
                    self.agents.set_agent_terminated(id);
                }
            }
        }
    }

    fn on_pty_exit(&mut self, id: &TerminalId, exit_code: Option<u32>) {
        if !self.registry.contains(id) {
            return;
        }
        info!(terminal_id = %id, exit_code = ?exit_code, "terminal process exited");
        self.bridge.send(HostMessage::TerminalExited {
            terminal_id: self.output.ui_id(id),
            exit_code,
        });
        if let Err(err) = self.remove_terminal(id, true, "process exited") {
            warn!(terminal_id = %id, error = %err, "failed to remove exited terminal");
        }

        if !self.shutting_down && self.orchestrator.is_completed() && self.registry.len() < self.settings.min_terminals
        {
            info!("last terminal exited, creating a replacement");
            if let Err(err) = self.create_terminal(CreateOptions::default()) {
                error!(error = %err, "replacement terminal creation failed");
            }
        }
        self.save_session();
    }

    /// Tear down every per-terminal record so late events become inert.
    pub fn remove_terminal(&mut self, id: &TerminalId, force: bool, reason: &str) -> Result<()> {
        let ui_id = self.output.ui_id(id);
        let session = self.registry.remove(id, force)?;
        let was_active = session.is_active;
        session.into_pty().kill();

        self.watchdog.stop_all(id, reason);
        self.init.reset(id);
        self.output.discard(id);
        self.scrollback.remove(id);
        self.safe_mode.remove(id);
        self.unconfirmed_surfaces.remove(id);
        self.prompt_carry.remove(id);
        self.detector.forget(id);
        self.agents.remove_terminal_completely(id);
        info!(terminal_id = %id, reason, "terminal removed");

        self.bridge.send(HostMessage::TerminalRemoved { terminal_id: ui_id });
        if was_active {
            if let Some(active) = self.registry.active_id() {
                self.bridge.send(HostMessage::FocusTerminal {
                    terminal_id: self.output.ui_id(&active),
                });
            }
        }
        Ok(())
    }

    fn on_timer(&mut self, key: &TimerKey) {
        let Some(firing) = self.watchdog.on_fire(key) else {
            return;
        };
        if !self.registry.contains(&firing.terminal_id) {
            debug!(terminal_id = %firing.terminal_id, "watchdog fired for removed terminal");
            self.watchdog.stop_all(&firing.terminal_id, "terminal gone");
            return;
        }
        match firing.phase {
            WatchdogPhase::Ack => self.on_ack_timeout(&firing),
            WatchdogPhase::Prompt => self.on_prompt_timeout(&firing),
        }
    }

    fn on_ack_timeout(&mut self, firing: &WatchdogFiring) {
        let id = &firing.terminal_id;
        let acked = self
            .init
            .get_state(id)
            .is_some_and(|state| state >= InitializationState::ViewReady);
        let surface_pending = self.unconfirmed_surfaces.contains(id);
        if acked && !surface_pending {
            return;
        }

        if !firing.is_final_attempt {
            let retries = self.init.increment_retry(id);
            debug!(terminal_id = %id, attempt = firing.attempt, retries, "no ack yet, re-sending terminalCreated");
            if let Some(session) = self.registry.get(id) {
                let info = TerminalInfo {
                    id: self.output.ui_id(id),
                    ..TerminalInfo::from(session)
                };
                self.bridge.send(HostMessage::TerminalCreated(info));
            }
            return;
        }

        warn!(terminal_id = %id, attempts = firing.attempt, "UI never acknowledged terminal, continuing without ack");
        self.metrics.ack_exhausted();
        self.telemetry.record(TelemetryEvent::HandshakeAckExhausted {
            terminal_id: id.clone(),
            attempts: firing.attempt,
        });
        if acked {
            self.confirm_surface(id);
            return;
        }
        self.init.mark_view_ready(id, "ack watchdog exhausted");
        self.begin_shell_initialization(id);
    }

    fn on_prompt_timeout(&mut self, firing: &WatchdogFiring) {
        if !firing.is_final_attempt {
            return;
        }
        let id = firing.terminal_id.clone();
        let prompt_seen = self
            .init
            .get_state(&id)
            .is_some_and(|state| state >= InitializationState::PromptReady);
        if prompt_seen {
            return;
        }

        if self.safe_mode.insert(id.clone()) {
            warn!(terminal_id = %id, "no prompt after shell integration, retrying in safe mode");
            self.metrics.safe_mode_entered();
            self.telemetry.record(TelemetryEvent::SafeModeEntered { terminal_id: id.clone() });
            self.write_integration(&id, true);
            self.watchdog.start(&id, WatchdogPhase::Prompt, self.settings.prompt_watchdog);
            return;
        }

        error!(terminal_id = %id, "no prompt in safe mode, shell initialization failed");
        self.init.mark_failed(&id, "prompt not detected in safe mode");
        self.metrics.shell_init_failed();
        self.telemetry.record(TelemetryEvent::ShellInitFailed { terminal_id: id.clone() });

        let name = self
            .registry
            .get(&id)
            .map(|session| session.name.clone())
            .unwrap_or_else(|| id.to_string());
        self.notify(
            NotificationLevel::Warning,
            format!("{name} did not reach a shell prompt"),
        );
        self.notify(
            NotificationLevel::Error,
            format!("{name} could not initialize its shell. Close it and create a new terminal."),
        );
    }

    fn send_agent_state_sync(&mut self) {
        let terminal_states: BTreeMap<TerminalId, AgentTerminalState> = self
            .registry
            .list()
            .into_iter()
            .map(|session| {
                let (status, agent_type) = self.agents.status_of(session.id.as_str());
                (self.output.ui_id(&session.id), AgentTerminalState { status, agent_type })
            })
            .collect();
        self.bridge.send(HostMessage::CliAgentFullStateSync { terminal_states });
    }

    fn flush_agent_sync(&mut self) {
        if self.agents_dirty.swap(false, Ordering::SeqCst) && !self.shutting_down {
            self.send_agent_state_sync();
        }
    }

    fn notify(&mut self, level: NotificationLevel, message: String) {
        self.bridge.send(HostMessage::Notification { level, message });
    }

    fn resolve_cwd(&self, requested: Option<PathBuf>) -> PathBuf {
        requested
            .filter(|path| path.is_dir())
            .or_else(|| self.settings.workspace_path.clone().filter(|path| path.is_dir()))
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    fn save_session(&mut self) {
        if self.persistence.is_none() || self.registry.is_empty() {
            return;
        }
        let now = now_millis();
        let terminals: Vec<PersistedTerminal> = self
            .registry
            .list()
            .into_iter()
            .map(|session| PersistedTerminal {
                id: session.id.clone(),
                name: session.name.clone(),
                cwd: session.cwd.to_string_lossy().to_string(),
                scrollback: self
                    .scrollback
                    .get(&session.id)
                    .map(ScrollbackBuffer::snapshot)
                    .unwrap_or_default(),
                is_active: session.is_active,
                terminal_number: session.number,
                last_updated: now,
            })
            .collect();
        let snapshot = SessionSnapshot::new(
            terminals,
            self.registry.active_id(),
            self.settings
                .workspace_path
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
        );

        if let Some(persistence) = self.persistence.as_mut() {
            if let Err(err) = persistence.save(&snapshot) {
                warn!(error = %err, "session snapshot not saved");
            }
        }
    }

    /// Persist, stop every timer and kill every PTY. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!(terminals = self.registry.len(), "host shutting down");
        self.save_session();
        self.shutting_down = true;

        self.watchdog.clear();
        for id in self.registry.drain() {
            self.init.reset(&id);
        }
        self.scrollback.clear();
        self.safe_mode.clear();
        self.unconfirmed_surfaces.clear();
        self.prompt_carry.clear();
        self.output.clear();
        self.agents.dispose();
        self.router.unregister_all();
        self.bridge.set_transport(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::HostHarness;
    use std::time::Duration;

    #[test]
    fn timer_for_removed_terminal_is_inert() {
        let mut harness = HostHarness::started();
        let first = harness.terminal_ids()[0].clone();
        harness.ack(&first);
        harness.pty_data(&first, "\x1b]133;A\x07$ ");

        harness.ui(UiMessage::CreateTerminal {
            ui_id: None,
            cwd: None,
            name: None,
        });
        let second = harness.terminal_ids()[1].clone();
        assert!(harness.host.is_watchdog_armed(&second, WatchdogPhase::Ack));
        harness.ui(UiMessage::DeleteTerminal {
            terminal_id: second.clone(),
        });
        assert!(!harness.host.is_watchdog_armed(&second, WatchdogPhase::Ack));

        harness.transport.take();
        harness.advance(Duration::from_millis(700));
        assert!(!harness.transport.commands().contains(&"terminalCreated"));
        assert_eq!(harness.host.initialization_state(second.as_str()), None);
    }

    #[test]
    fn unacknowledged_surface_after_reconnect_resumes_output_when_watchdog_gives_up() {
        let mut harness = HostHarness::started();
        let id = harness.terminal_ids()[0].clone();
        harness.ack(&id);
        harness.pty_data(&id, "\x1b]133;A\x07$ ");

        harness.host.handle_event(HostEvent::TransportDetached);
        harness.pty_data(&id, "held");
        harness.connect();
        harness.ui(UiMessage::WebviewReady);
        harness.ui(UiMessage::WebviewInitialized);
        harness.transport.take();

        for step in [700, 1400, 2800] {
            assert_eq!(harness.advance(Duration::from_millis(step)), 1);
        }
        assert!(!harness.host.is_output_open(id.as_str()));
        assert_eq!(
            harness
                .transport
                .commands()
                .iter()
                .filter(|command| **command == "terminalCreated")
                .count(),
            3
        );

        assert_eq!(harness.advance(Duration::from_millis(5600)), 1);
        assert!(harness.host.is_output_open(id.as_str()));
        assert_eq!(harness.host.initialization_state(id.as_str()), Some(InitializationState::PromptReady));
        assert!(harness.transport.messages().contains(&HostMessage::Output {
            terminal_id: id.clone(),
            data: "held".into(),
        }));
    }

    #[test]
    fn prompt_mark_split_across_reads_is_detected() {
        let mut harness = HostHarness::started();
        let id = harness.terminal_ids()[0].clone();
        harness.ack(&id);

        harness.pty_data(&id, "user@host \x1b]13");
        harness.pty_data(&id, "3;A\x07");

        assert_eq!(harness.host.initialization_state(id.as_str()), Some(InitializationState::PromptReady));
        assert!(!harness.host.is_watchdog_armed(&id, WatchdogPhase::Prompt));
    }

    #[test]
    fn input_and_resize_reach_the_pty() {
        let mut harness = HostHarness::started();
        let id = harness.terminal_ids()[0].clone();
        harness.ack(&id);

        harness.ui(UiMessage::Input {
            terminal_id: id.clone(),
            data: "echo hi\r".into(),
        });
        harness.ui(UiMessage::Resize {
            terminal_id: id.clone(),
            cols: 120,
            rows: 40,
        });

        let pty = harness.spawner.pty(id.as_str()).unwrap();
        assert!(pty.written().ends_with("echo hi\r"));
        assert_eq!(pty.resizes(), vec![(120, 40)]);
    }

    #[test]
    fn deleting_last_terminal_is_refused_with_notification() {
        let mut harness = HostHarness::started();
        let id = harness.terminal_ids()[0].clone();
        harness.transport.take();

        harness.ui(UiMessage::DeleteTerminal { terminal_id: id.clone() });

        assert!(harness.host.registry().contains(&id));
        assert!(harness.transport.messages().iter().any(|message| matches!(
            message,
            HostMessage::Notification {
                level: NotificationLevel::Warning,
                ..
            }
        )));
    }

    #[test]
    fn pty_exit_replaces_last_terminal() {
        let mut harness = HostHarness::started();
        let id = harness.terminal_ids()[0].clone();

        harness.host.handle_event(HostEvent::Pty(PtyEvent::Exit {
            terminal_id: id.clone(),
            exit_code: Some(0),
        }));

        assert!(!harness.host.registry().contains(&id));
        assert_eq!(harness.host.registry().len(), 1);
        let commands = harness.transport.commands();
        assert!(commands.contains(&"terminalExited"));
        assert!(commands.contains(&"terminalRemoved"));
    }

    #[test]
    fn agent_banner_triggers_full_state_sync() {
        let mut harness = HostHarness::started();
        let id = harness.terminal_ids()[0].clone();
        harness.ack(&id);
        harness.transport.take();

        harness.pty_data(&id, "Welcome to Claude Code!\r\n");

        let sync = harness
            .transport
            .messages()
            .into_iter()
            .find_map(|message| match message {
                HostMessage::CliAgentFullStateSync { terminal_states } => Some(terminal_states),
                _ => None,
            })
            .unwrap();
        assert_eq!(sync[&id].status, crate::agent::AgentStatus::Connected);
        assert_eq!(harness.host.agents().get_connected_agent_terminal_id(), Some(&id));
    }
}
