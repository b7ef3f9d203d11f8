//! Termdeck - terminal host for CLI coding agents
//!
//! Usage:
//!   termdeck serve [--port N] [--workspace DIR] [--no-persist]
//!   termdeck session show|clear [--workspace DIR]
//!   termdeck config

fn main() {
    termdeck::cli::run();
}
