use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use crate::error::Result;
use crate::scheduler::Clock;

/// Host startup phases, in order. `Failed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OrchestrationPhase {
    NotStarted,
    WebviewSetup,
    MessageHandlers,
    TerminalSetup,
    ServicesReady,
    Completed,
    Failed,
}

impl fmt::Display for OrchestrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OrchestrationPhase::NotStarted => "not-started",
            OrchestrationPhase::WebviewSetup => "webview-setup",
            OrchestrationPhase::MessageHandlers => "message-handlers",
            OrchestrationPhase::TerminalSetup => "terminal-setup",
            OrchestrationPhase::ServicesReady => "services-ready",
            OrchestrationPhase::Completed => "completed",
            OrchestrationPhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationFailure {
    pub phase: OrchestrationPhase,
    pub error: String,
    pub duration_ms: u64,
}

impl fmt::Display for OrchestrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed after {}ms: {}", self.phase, self.duration_ms, self.error)
    }
}

/// Proof that a phase was entered; hand it back to [`SessionOrchestrator::finish`].
#[must_use]
#[derive(Debug)]
pub struct PhaseStart {
    phase: OrchestrationPhase,
    started: Instant,
}

/// Sequences and times the startup phases. The work of each phase is done
/// by the host between `begin` and `finish`.
pub struct SessionOrchestrator {
    phase: OrchestrationPhase,
    started_at: Option<Instant>,
    timings: Vec<(OrchestrationPhase, Duration)>,
    failure: Option<OrchestrationFailure>,
    clock: Arc<dyn Clock>,
}

impl SessionOrchestrator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            phase: OrchestrationPhase::NotStarted,
            started_at: None,
            timings: Vec::new(),
            failure: None,
            clock,
        }
    }

    /// Enter `phase`. Phases must move forward; a failed run stays failed
    /// until [`restart`](Self::restart).
    pub fn begin(&mut self, phase: OrchestrationPhase) -> std::result::Result<PhaseStart, OrchestrationFailure> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let now = self.clock.now();
        if phase <= self.phase || phase >= OrchestrationPhase::Completed {
            let failure = OrchestrationFailure {
                phase,
                error: format!("phase {phase} requested while at {}", self.phase),
                duration_ms: 0,
            };
            return Err(self.fail(failure));
        }
        self.started_at.get_or_insert(now);
        Ok(PhaseStart { phase, started: now })
    }

    pub fn finish<T>(&mut self, start: PhaseStart, result: Result<T>) -> std::result::Result<T, OrchestrationFailure> {
        let elapsed = self.clock.now().saturating_duration_since(start.started);
        self.timings.push((start.phase, elapsed));
        match result {
            Ok(value) => {
                self.phase = start.phase;
                info!(phase = %start.phase, duration_ms = elapsed.as_millis() as u64, "orchestration phase done");
                Ok(value)
            }
            Err(err) => Err(self.fail(OrchestrationFailure {
                phase: start.phase,
                error: err.to_string(),
                duration_ms: elapsed.as_millis() as u64,
            })),
        }
    }

    /// Mark the run complete and return its total duration.
    pub fn complete(&mut self) -> Duration {
        self.phase = OrchestrationPhase::Completed;
        let total = self
            .started_at
            .map(|started| self.clock.now().saturating_duration_since(started))
            .unwrap_or_default();
        info!(duration_ms = total.as_millis() as u64, "session orchestration completed");
        total
    }

    /// Forget the previous run, for a freshly attached UI.
    pub fn restart(&mut self) {
        self.phase = OrchestrationPhase::NotStarted;
        self.started_at = None;
        self.timings.clear();
        self.failure = None;
    }

    pub fn phase(&self) -> OrchestrationPhase {
        self.phase
    }

    pub fn is_completed(&self) -> bool {
        self.phase == OrchestrationPhase::Completed
    }

    pub fn failure(&self) -> Option<&OrchestrationFailure> {
        self.failure.as_ref()
    }

    pub fn timings(&self) -> &[(OrchestrationPhase, Duration)] {
        &self.timings
    }

    fn fail(&mut self, failure: OrchestrationFailure) -> OrchestrationFailure {
        error!(phase = %failure.phase, duration_ms = failure.duration_ms, error = %failure.error, "orchestration failed");
        self.phase = OrchestrationPhase::Failed;
        self.failure = Some(failure.clone());
        failure
    }
}
