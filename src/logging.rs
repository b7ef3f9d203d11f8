use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};

use crate::constants::APP_NAME;

/// Install the global subscriber: a daily-rolling file under `data_dir/logs`
/// and, with `TERMDECK_LOG_STDERR`, a colored stderr layer. The returned
/// guard must be held for the life of the process.
pub fn init_logging(data_dir: &Path) -> Option<WorkerGuard> {
    if env_flag("TERMDECK_LOG_DISABLE") {
        return None;
    }

    let log_dir = env::var_os("TERMDECK_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"));

    if let Err(err) = fs::create_dir_all(&log_dir) {
        eprintln!(
            "Warning: failed to create log directory {}: {}",
            log_dir.display(),
            err
        );
        return None;
    }

    let filter = match env::var("TERMDECK_LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => EnvFilter::new(level),
        _ => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{APP_NAME}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    let stderr_layer = env_flag("TERMDECK_LOG_STDERR").then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
    });

    let installed = Registry::default()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
    if let Err(err) = installed {
        eprintln!("Warning: logging already initialized: {err}");
    }
    Some(guard)
}

/// Minimal stderr logging for short-lived CLI commands.
pub fn init_cli_logging() {
    let filter = match env::var("TERMDECK_LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => EnvFilter::new(level),
        _ => EnvFilter::new("warn"),
    };
    let _ = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|value| is_truthy(&value))
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}
