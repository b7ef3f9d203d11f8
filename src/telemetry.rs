use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{info, warn};

use crate::terminal::TerminalId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    HandshakeAckExhausted { terminal_id: TerminalId, attempts: u32 },
    SafeModeEntered { terminal_id: TerminalId },
    ShellInitFailed { terminal_id: TerminalId },
    OrchestrationCompleted { duration_ms: u64, terminal_count: usize },
    OrchestrationFailed { phase: String, duration_ms: u64, error: String },
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::HandshakeAckExhausted { .. } => "handshake_ack_exhausted",
            TelemetryEvent::SafeModeEntered { .. } => "safe_mode_entered",
            TelemetryEvent::ShellInitFailed { .. } => "shell_init_failed",
            TelemetryEvent::OrchestrationCompleted { .. } => "orchestration_completed",
            TelemetryEvent::OrchestrationFailed { .. } => "orchestration_failed",
        }
    }
}

/// Fire-and-forget sink; implementations must not block the host loop.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::OrchestrationFailed { phase, duration_ms, error } => {
                warn!(target: "termdeck::telemetry", event = event.name(), phase, duration_ms, error, "telemetry");
            }
            TelemetryEvent::ShellInitFailed { terminal_id } | TelemetryEvent::SafeModeEntered { terminal_id } => {
                warn!(target: "termdeck::telemetry", event = event.name(), terminal_id = %terminal_id, "telemetry");
            }
            TelemetryEvent::HandshakeAckExhausted { terminal_id, attempts } => {
                warn!(target: "termdeck::telemetry", event = event.name(), terminal_id = %terminal_id, attempts, "telemetry");
            }
            TelemetryEvent::OrchestrationCompleted { duration_ms, terminal_count } => {
                info!(target: "termdeck::telemetry", event = event.name(), duration_ms, terminal_count, "telemetry");
            }
        }
    }
}

/// Process-lifetime counters for the handshake.
#[derive(Debug, Default)]
pub struct HostMetrics {
    ack_exhausted: AtomicU64,
    safe_mode_entered: AtomicU64,
    shell_init_failed: AtomicU64,
    terminals_created: AtomicU64,
    output_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub ack_exhausted: u64,
    pub safe_mode_entered: u64,
    pub shell_init_failed: u64,
    pub terminals_created: u64,
    pub output_bytes: u64,
}

impl HostMetrics {
    pub fn ack_exhausted(&self) {
        self.ack_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn safe_mode_entered(&self) {
        self.safe_mode_entered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shell_init_failed(&self) {
        self.shell_init_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn terminal_created(&self) {
        self.terminals_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn output(&self, bytes: usize) {
        self.output_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ack_exhausted: self.ack_exhausted.load(Ordering::Relaxed),
            safe_mode_entered: self.safe_mode_entered.load(Ordering::Relaxed),
            shell_init_failed: self.shell_init_failed.load(Ordering::Relaxed),
            terminals_created: self.terminals_created.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
        }
    }
}
