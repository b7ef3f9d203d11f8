//! Host ↔ UI messaging
//!
//! `protocol` defines the wire messages, `transport` the readiness-gated
//! outbound bridge and `router` the inbound command table.

pub mod protocol;
mod router;
mod transport;

pub use protocol::{AgentTerminalState, CommandKind, HostMessage, NotificationLevel, UiMessage};
pub use router::CommandRouter;
pub use transport::{ChannelTransport, MessageBridge, Transport};
