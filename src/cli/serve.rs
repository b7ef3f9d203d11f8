//! Foreground host process
//!
//! Wires the host to native PTYs, tokio timers, the session store and the
//! UI socket, then runs until Ctrl+C.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::{self, HostSettings};
use crate::error::Result;
use crate::host::{pty_event_sink, Host, HostDeps, HostEvent};
use crate::logging::init_logging;
use crate::scheduler::TokioScheduler;
use crate::server;
use crate::terminal::NativePtySpawner;

pub fn run(settings: HostSettings, persist: bool) -> Result<()> {
    let data_dir = config::data_dir()?;
    fs::create_dir_all(&data_dir)?;
    let _log_guard = init_logging(&data_dir);
    info!(
        data_dir = %data_dir.display(),
        workspace = ?settings.workspace_path,
        persist,
        "termdeck starting"
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run_host(settings, data_dir, persist));
    if let Err(err) = &result {
        error!(error = %err, "termdeck stopped with error");
    }
    result
}

async fn run_host(settings: HostSettings, data_dir: PathBuf, persist: bool) -> Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();

    let timer_tx = tx.clone();
    let scheduler = Arc::new(TokioScheduler::new(move |key| {
        let _ = timer_tx.send(HostEvent::Timer(key));
    }));
    let spawner = Arc::new(NativePtySpawner::new(settings.shell_override.clone()));

    let mut deps = HostDeps::new(
        settings.clone(),
        spawner,
        scheduler.clone(),
        scheduler,
        pty_event_sink(tx.clone()),
    );
    if persist && settings.persistence.enabled {
        let persistence = super::session::open_persistence(&data_dir, &settings, settings.workspace_path.as_deref());
        deps = deps.with_persistence(persistence);
    }
    let host = Host::new(deps);

    let listener = server::bind(settings.port).await?;
    let port = listener.local_addr()?.port();
    server::write_port_file(&data_dir, port)?;
    println!("termdeck listening on 127.0.0.1:{port} (Ctrl+C to stop)");

    let server_task = tokio::spawn(server::serve(listener, tx.clone()));
    let signal_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = signal_tx.send(HostEvent::Shutdown);
        }
    });
    drop(tx);

    host.run(rx).await;

    server_task.abort();
    server::remove_port_file(&data_dir);
    info!("termdeck stopped");
    Ok(())
}
