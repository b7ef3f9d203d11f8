//! PTY output routing
//!
//! Output for a terminal is withheld until its initialization gate opens and
//! then released in one piece, so the UI never sees bytes for a surface it
//! has not created yet and never sees them out of order.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::terminal::TerminalId;

/// Output addressed with the UI-side terminal id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub terminal_id: TerminalId,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Forwarded(OutputFrame),
    Buffered { pending_bytes: usize },
}

/// Host id ↔ UI id lookups for terminals the UI named before the host
/// assigned its own id.
#[derive(Debug, Default)]
struct IdMapping {
    to_ui: HashMap<TerminalId, TerminalId>,
    to_host: HashMap<TerminalId, TerminalId>,
}

#[derive(Debug, Default)]
struct PendingOutput {
    chunks: VecDeque<String>,
    bytes: usize,
}

pub struct OutputRouter {
    buffers: HashMap<TerminalId, PendingOutput>,
    // Created on first use; `None` means every id maps to itself.
    mapping: Option<IdMapping>,
    limit_bytes: usize,
}

impl OutputRouter {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            mapping: None,
            limit_bytes,
        }
    }

    /// Forward immediately when the gate is open and nothing is queued ahead;
    /// otherwise append to the terminal's buffer.
    pub fn on_data(&mut self, host_id: &TerminalId, data: String, gate_open: bool) -> Routed {
        let queued_ahead = self
            .buffers
            .get(host_id)
            .is_some_and(|pending| !pending.chunks.is_empty());

        if gate_open && !queued_ahead {
            return Routed::Forwarded(OutputFrame {
                terminal_id: self.ui_id(host_id),
                data,
            });
        }

        let pending_bytes = self.buffer(host_id, data);
        Routed::Buffered { pending_bytes }
    }

    /// Queue output regardless of the gate (restored scrollback, for one).
    pub fn buffer(&mut self, host_id: &TerminalId, data: String) -> usize {
        let limit = self.limit_bytes;
        let pending = self.buffers.entry(host_id.clone()).or_default();
        pending.bytes += data.len();
        pending.chunks.push_back(data);

        let mut dropped = 0usize;
        while pending.bytes > limit && pending.chunks.len() > 1 {
            if let Some(oldest) = pending.chunks.pop_front() {
                pending.bytes -= oldest.len();
                dropped += oldest.len();
            }
        }
        if dropped > 0 {
            warn!(terminal_id = %host_id, dropped_bytes = dropped, "output buffer over limit, oldest output dropped");
        }
        pending.bytes
    }

    /// Concatenate everything buffered for the terminal, in arrival order,
    /// and clear the buffer.
    pub fn flush_buffered_output(&mut self, host_id: &TerminalId) -> Option<OutputFrame> {
        let pending = self.buffers.remove(host_id)?;
        if pending.chunks.is_empty() {
            return None;
        }
        let mut data = String::with_capacity(pending.bytes);
        for chunk in pending.chunks {
            data.push_str(&chunk);
        }
        debug!(terminal_id = %host_id, bytes = data.len(), "flushing buffered output");
        Some(OutputFrame {
            terminal_id: self.ui_id(host_id),
            data,
        })
    }

    pub fn pending_bytes(&self, host_id: &str) -> usize {
        self.buffers.get(host_id).map_or(0, |pending| pending.bytes)
    }

    /// Forget buffered output and any id mapping for a removed terminal.
    pub fn discard(&mut self, host_id: &TerminalId) {
        if let Some(pending) = self.buffers.remove(host_id) {
            if pending.bytes > 0 {
                debug!(terminal_id = %host_id, bytes = pending.bytes, "discarding unflushed output");
            }
        }
        if let Some(mapping) = self.mapping.as_mut() {
            if let Some(ui_id) = mapping.to_ui.remove(host_id) {
                mapping.to_host.remove(&ui_id);
            }
        }
    }

    pub fn map_ids(&mut self, host_id: &TerminalId, ui_id: &TerminalId) {
        if host_id == ui_id {
            return;
        }
        let mapping = self.mapping.get_or_insert_with(IdMapping::default);
        mapping.to_ui.insert(host_id.clone(), ui_id.clone());
        mapping.to_host.insert(ui_id.clone(), host_id.clone());
    }

    pub fn ui_id(&self, host_id: &TerminalId) -> TerminalId {
        self.mapping
            .as_ref()
            .and_then(|mapping| mapping.to_ui.get(host_id))
            .unwrap_or(host_id)
            .clone()
    }

    pub fn host_id(&self, ui_id: &TerminalId) -> TerminalId {
        self.mapping
            .as_ref()
            .and_then(|mapping| mapping.to_host.get(ui_id))
            .unwrap_or(ui_id)
            .clone()
    }

    pub fn has_mapping(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.mapping = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> TerminalId {
        TerminalId::new(value)
    }

    #[test]
    fn buffered_chunks_flush_as_one_ordered_emission() {
        let mut router = OutputRouter::new(1024);
        let t = id("t");
        for chunk in ["a", "b", "c"] {
            assert!(matches!(router.on_data(&t, chunk.into(), false), Routed::Buffered { .. }));
        }

        let flushed = router.flush_buffered_output(&t).unwrap();
        assert_eq!(flushed.data, "abc");

        let next = router.on_data(&t, "d".into(), true);
        assert_eq!(
            next,
            Routed::Forwarded(OutputFrame {
                terminal_id: t.clone(),
                data: "d".into()
            })
        );
        assert_eq!(router.flush_buffered_output(&t), None);
    }

    #[test]
    fn data_arriving_after_gate_opens_but_before_flush_queues_behind() {
        let mut router = OutputRouter::new(1024);
        let t = id("t");
        router.on_data(&t, "early".into(), false);
        assert!(matches!(router.on_data(&t, "-late".into(), true), Routed::Buffered { .. }));
        assert_eq!(router.flush_buffered_output(&t).unwrap().data, "early-late");
    }

    #[test]
    fn discard_drops_pending_output() {
        let mut router = OutputRouter::new(1024);
        let t = id("t");
        router.on_data(&t, "lost".into(), false);
        router.discard(&t);
        assert_eq!(router.pending_bytes("t"), 0);
        assert_eq!(router.flush_buffered_output(&t), None);
    }

    #[test]
    fn overflow_evicts_oldest_chunks() {
        let mut router = OutputRouter::new(4);
        let t = id("t");
        router.buffer(&t, "aaa".into());
        router.buffer(&t, "bbb".into());
        assert_eq!(router.flush_buffered_output(&t).unwrap().data, "bbb");
    }

    #[test]
    fn id_mapping_is_lazy_with_identity_fallback() {
        let mut router = OutputRouter::new(1024);
        assert!(!router.has_mapping());
        assert_eq!(router.ui_id(&id("host-1")), id("host-1"));

        router.map_ids(&id("host-1"), &id("ui-1"));
        assert!(router.has_mapping());
        assert_eq!(router.ui_id(&id("host-1")), id("ui-1"));
        assert_eq!(router.host_id(&id("ui-1")), id("host-1"));
        assert_eq!(router.host_id(&id("other")), id("other"));

        let frame = router.on_data(&id("host-1"), "x".into(), true);
        assert!(matches!(frame, Routed::Forwarded(OutputFrame { terminal_id, .. }) if terminal_id == id("ui-1")));

        router.discard(&id("host-1"));
        assert_eq!(router.host_id(&id("ui-1")), id("ui-1"));
    }
}
