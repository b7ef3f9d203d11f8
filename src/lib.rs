//! Termdeck terminal host
//!
//! Runs shell sessions on native PTYs and streams them to a UI over a
//! line-delimited JSON channel. Output only flows once the UI has
//! confirmed each terminal, and CLI coding agents running inside the
//! terminals are tracked so the UI can show which one is live.

pub mod agent;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod host;
pub mod init;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod persistence;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod terminal;
pub mod util;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{Error, Result};
pub use host::{Host, HostDeps, HostEvent};
