//! Local socket the UI connects to
//!
//! One JSON message per line in both directions. Every accepted connection
//! becomes the host's transport and replaces the previous one, since the
//! host talks to a single UI at a time.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::{ChannelTransport, UiMessage};
use crate::config::port_file_path;
use crate::error::Result;
use crate::host::HostEvent;

/// Bind on loopback. Port 0 lets the OS choose.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port = listener.local_addr()?.port(), "termdeck listening");
    Ok(listener)
}

/// Accept UI connections until `events` closes.
pub async fn serve(listener: TcpListener, events: mpsc::UnboundedSender<HostEvent>) -> Result<()> {
    let current = Arc::new(AtomicU64::new(0));
    loop {
        let (stream, peer) = listener.accept().await?;
        if events.is_closed() {
            return Ok(());
        }
        let connection = current.fetch_add(1, Ordering::SeqCst) + 1;
        info!(peer = %peer, connection, "UI connection accepted");
        tokio::spawn(handle_connection(stream, connection, current.clone(), events.clone()));
    }
}

async fn handle_connection(
    stream: TcpStream,
    connection: u64,
    current: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let write_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = out_rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let transport = Box::new(ChannelTransport::new(out_tx));
    if events.send(HostEvent::TransportAttached(transport)).is_err() {
        write_task.abort();
        return;
    }

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(connection, error = %err, "UI connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if current.load(Ordering::SeqCst) != connection {
            info!(connection, "connection superseded, no longer forwarding");
            break;
        }
        let message: UiMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                warn!(connection, error = %err, "UI message parse failed");
                continue;
            }
        };
        debug!(connection, command = ?message.kind(), "UI message");
        if events.send(HostEvent::Ui(message)).is_err() {
            break;
        }
    }

    // A newer connection already owns the host transport.
    if current.load(Ordering::SeqCst) == connection {
        let _ = events.send(HostEvent::TransportDetached);
    }
    write_task.abort();
    info!(connection, "UI connection closed");
}

pub fn write_port_file(data_dir: &Path, port: u16) -> Result<()> {
    let path = port_file_path(data_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    crate::util::atomic_write(&path, port.to_string().as_bytes())?;
    Ok(())
}

pub fn remove_port_file(data_dir: &Path) {
    let path = port_file_path(data_dir);
    if let Err(err) = fs::remove_file(&path) {
        debug!(path = %path.display(), error = %err, "port file not removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{HostMessage, Transport};
    use tokio::io::AsyncReadExt;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<HostEvent>) -> HostEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn connection_attaches_transport_and_forwards_messages() {
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve(listener, tx));

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut transport = match next_event(&mut rx).await {
            HostEvent::TransportAttached(transport) => transport,
            other => panic!("expected attach, got {other:?}"),
        };

        client
            .write_all(b"not json\n{\"command\":\"webviewReady\"}\n")
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            HostEvent::Ui(UiMessage::WebviewReady)
        ));

        transport
            .post(&HostMessage::ExtensionReady { timestamp: 7 })
            .unwrap();
        let mut buf = vec![0u8; 256];
        let read = client.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..read]);
        assert_eq!(line.trim_end(), r#"{"command":"extensionReady","timestamp":7}"#);

        drop(client);
        assert!(matches!(next_event(&mut rx).await, HostEvent::TransportDetached));
        server.abort();
    }

    #[tokio::test]
    async fn superseded_connection_does_not_detach_newer_one() {
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve(listener, tx));

        let first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, HostEvent::TransportAttached(_)));
        let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, HostEvent::TransportAttached(_)));

        drop(first);
        second.write_all(b"{\"command\":\"requestStateSync\"}\n").await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            HostEvent::Ui(UiMessage::RequestStateSync)
        ));
        server.abort();
    }

    #[tokio::test]
    async fn superseded_connection_cannot_drive_the_host() {
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve(listener, tx));

        let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, HostEvent::TransportAttached(_)));
        let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, HostEvent::TransportAttached(_)));

        first.write_all(b"{\"command\":\"webviewReady\"}\n").await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(std::time::Duration::from_secs(5), first.read(&mut buf))
            .await
            .expect("stale connection closed in time");
        assert!(matches!(read, Ok(0) | Err(_)));

        second.write_all(b"{\"command\":\"requestStateSync\"}\n").await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            HostEvent::Ui(UiMessage::RequestStateSync)
        ));
        server.abort();
    }

    #[test]
    fn port_file_is_written_under_daemon_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_port_file(dir.path(), 4123).unwrap();
        let written = fs::read_to_string(port_file_path(dir.path())).unwrap();
        assert_eq!(written, "4123");

        remove_port_file(dir.path());
        assert!(!port_file_path(dir.path()).exists());
    }
}
