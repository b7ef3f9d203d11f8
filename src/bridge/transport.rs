use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::HostMessage;
use crate::error::{Error, Result};

/// Outbound half of a UI connection.
pub trait Transport: Send {
    fn post(&mut self, message: &HostMessage) -> Result<()>;
}

/// Serializes each message as one JSON line into a channel drained by the
/// connection's writer task.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl Transport for ChannelTransport {
    fn post(&mut self, message: &HostMessage) -> Result<()> {
        let line = serde_json::to_string(message)?;
        self.tx
            .send(line)
            .map_err(|_| Error::Transport("channel closed".into()))
    }
}

/// Readiness-gated delivery to the UI. Messages sent before the UI reports
/// ready are queued and released in order by [`MessageBridge::mark_ready`].
pub struct MessageBridge {
    transport: Option<Box<dyn Transport>>,
    ready: bool,
    pending: VecDeque<HostMessage>,
    queue_limit: usize,
}

impl MessageBridge {
    pub fn new(queue_limit: usize) -> Self {
        Self {
            transport: None,
            ready: false,
            pending: VecDeque::new(),
            queue_limit: queue_limit.max(1),
        }
    }

    /// Deliver now, queue until the UI is ready, or drop when no UI is
    /// attached at all.
    pub fn send(&mut self, message: HostMessage) {
        if self.transport.is_none() {
            debug!(command = message.command(), "no transport, message dropped");
            return;
        }
        if self.ready {
            self.deliver(&message);
            return;
        }
        if self.pending.len() >= self.queue_limit {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(command = dropped.command(), limit = self.queue_limit, "pending queue full, oldest message dropped");
            }
        }
        debug!(command = message.command(), queued = self.pending.len() + 1, "queued until UI is ready");
        self.pending.push_back(message);
    }

    /// Flip to ready and flush the queue in FIFO order.
    pub fn mark_ready(&mut self) {
        if self.transport.is_none() {
            warn!("mark_ready without a transport ignored");
            return;
        }
        self.ready = true;
        let queued = self.pending.len();
        while let Some(message) = self.pending.pop_front() {
            self.deliver(&message);
        }
        info!(flushed = queued, "message bridge ready");
    }

    /// Replace the transport. Any change requires a fresh handshake; clearing
    /// it also drops whatever was still queued.
    pub fn set_transport(&mut self, transport: Option<Box<dyn Transport>>) {
        self.ready = false;
        match transport {
            Some(transport) => {
                self.transport = Some(transport);
                debug!(queued = self.pending.len(), "transport attached");
            }
            None => {
                self.transport = None;
                let dropped = self.pending.len();
                self.pending.clear();
                info!(dropped, "transport cleared");
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn deliver(&mut self, message: &HostMessage) {
        let Some(transport) = self.transport.as_mut() else {
            debug!(command = message.command(), "no transport, message dropped");
            return;
        };
        if let Err(err) = transport.post(message) {
            if err.is_transport_disposed() {
                debug!(command = message.command(), error = %err, "transport already disposed");
            } else {
                warn!(command = message.command(), error = %err, "failed to deliver message");
            }
        }
    }
}
