//! Per-terminal initialization tracking
//!
//! `state` records how far each terminal has progressed through the
//! handshake; `watchdog` supervises the steps that wait on the UI or the
//! shell and reports when they take too long.

mod state;
mod watchdog;

pub use state::{InitializationRecord, InitializationState, InitializationStateMachine, TransitionOutcome};
pub use watchdog::{InitializationWatchdog, WatchdogFiring, WatchdogOptions};
