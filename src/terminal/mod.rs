mod env;
pub mod pty;
mod registry;
pub mod shell;
mod types;

pub use pty::{NativePtySpawner, PtyEvent, PtyEventSink, PtyHandle, PtySpawner, SpawnRequest, SpawnedPty};
pub use registry::{NewTerminal, TerminalRegistry};
pub use types::{ScrollbackBuffer, TerminalId, TerminalInfo, TerminalSession};
