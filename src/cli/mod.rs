//! CLI module for termdeck
//!
//! Runs the host as a local daemon and inspects its stored state.

pub mod serve;
pub mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{self, HostSettings};
use crate::error::Result;

/// Termdeck - terminal host for CLI coding agents
#[derive(Parser)]
#[command(name = "termdeck", version, about = "Termdeck terminal host")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (default: ~/.termdeck/config/settings.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the host and wait for a UI to connect
    Serve {
        /// Listen port (0 picks a free one)
        #[arg(long)]
        port: Option<u16>,
        /// Workspace the terminals start in and the session is stored for
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Do not restore or save the terminal session
        #[arg(long)]
        no_persist: bool,
    },
    /// Inspect the stored terminal session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Print the effective settings as JSON
    Config,
}

#[derive(Subcommand)]
pub enum SessionAction {
    /// Print the stored session
    Show {
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Delete the stored session
    Clear {
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
}

/// Run the CLI
pub fn run() {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref());

    let result = match cli.command {
        Commands::Serve {
            port,
            workspace,
            no_persist,
        } => serve::run(apply_overrides(settings, port, workspace), !no_persist),
        Commands::Session { action } => match action {
            SessionAction::Show { workspace } => session::show(&settings, workspace.as_deref()),
            SessionAction::Clear { workspace } => session::clear(&settings, workspace.as_deref()),
        },
        Commands::Config => print_config(&settings),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_settings(path: Option<&std::path::Path>) -> HostSettings {
    match path {
        Some(path) => HostSettings::load(path),
        None => HostSettings::load(&config::settings_path(&config::termdeck_home())),
    }
}

fn apply_overrides(mut settings: HostSettings, port: Option<u16>, workspace: Option<PathBuf>) -> HostSettings {
    if let Some(port) = port {
        settings.port = port;
    }
    if let Some(workspace) = workspace {
        settings.workspace_path = Some(std::fs::canonicalize(&workspace).unwrap_or(workspace));
    }
    settings
}

fn print_config(settings: &HostSettings) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}
