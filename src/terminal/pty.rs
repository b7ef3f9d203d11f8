use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use tracing::{debug, error, info, warn};

use super::env::build_terminal_env;
use super::shell::ShellConfig;
use super::TerminalId;
use crate::error::{Error, Result};

/// Process handle for one terminal. The host only ever writes, resizes and
/// kills; output and exit arrive asynchronously through a [`PtyEventSink`].
pub trait PtyHandle: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;
    fn kill(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Data {
        terminal_id: TerminalId,
        data: String,
    },
    Exit {
        terminal_id: TerminalId,
        exit_code: Option<u32>,
    },
}

pub type PtyEventSink = Arc<dyn Fn(PtyEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub terminal_id: TerminalId,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub env: HashMap<String, String>,
}

pub struct SpawnedPty {
    pub handle: Box<dyn PtyHandle>,
    /// Shell binary name (`bash`, `zsh`, ...), used to pick the integration script
    pub shell: Option<String>,
}

pub trait PtySpawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest, sink: PtyEventSink) -> Result<SpawnedPty>;
}

/// Spawns the user's login shell on a native PTY via `portable-pty`.
#[derive(Debug, Clone, Default)]
pub struct NativePtySpawner {
    shell_override: Option<String>,
}

impl NativePtySpawner {
    pub fn new(shell_override: Option<String>) -> Self {
        Self { shell_override }
    }
}

struct NativePty {
    terminal_id: TerminalId,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    shutdown: Arc<AtomicBool>,
}

impl PtyHandle for NativePty {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .map_err(|e| Error::Pty(e.to_string()))?;
        self.writer.flush().map_err(|e| Error::Pty(e.to_string()))
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Pty(e.to_string()))
    }

    fn kill(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.killer.kill() {
            debug!(terminal_id = %self.terminal_id, error = %e, "kill: process already gone");
        }
    }
}

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, request: SpawnRequest, sink: PtyEventSink) -> Result<SpawnedPty> {
        let shell = ShellConfig::detect(self.shell_override.clone());
        let terminal_id = request.terminal_id.clone();

        info!(
            terminal_id = %terminal_id,
            shell = %shell.path.display(),
            cwd = %request.cwd.display(),
            cols = request.cols,
            rows = request.rows,
            "spawn_pty: opening PTY"
        );

        let pair = NativePtySystem::default()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| {
                error!(terminal_id = %terminal_id, error = %e, "spawn_pty: failed to open PTY");
                Error::Pty(e.to_string())
            })?;

        let mut cmd = CommandBuilder::new(&shell.path);
        cmd.args(&shell.login_args);
        cmd.cwd(&request.cwd);
        for (key, value) in build_terminal_env(&shell, &terminal_id) {
            cmd.env(key, value);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!(terminal_id = %terminal_id, error = %e, "spawn_pty: failed to spawn shell");
            Error::Pty(e.to_string())
        })?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Pty(e.to_string()))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let reader_shutdown = shutdown.clone();
        let reader_id = terminal_id.clone();

        thread::Builder::new()
            .name(format!("pty-reader-{}", terminal_id))
            .spawn(move || {
                let mut buffer = [0u8; 4096];
                let mut decoder = Utf8Decoder::default();
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = decoder.decode(&buffer[..n]);
                            if !data.is_empty() {
                                sink(PtyEvent::Data {
                                    terminal_id: reader_id.clone(),
                                    data,
                                });
                            }
                        }
                        Err(e) => {
                            if !reader_shutdown.load(Ordering::SeqCst) {
                                warn!(terminal_id = %reader_id, error = %e, "PTY read error");
                            }
                            break;
                        }
                    }
                }

                let tail = decoder.finish();
                if !tail.is_empty() {
                    sink(PtyEvent::Data {
                        terminal_id: reader_id.clone(),
                        data: tail,
                    });
                }

                let exit_code = match child.wait() {
                    Ok(status) => Some(status.exit_code()),
                    Err(e) => {
                        debug!(terminal_id = %reader_id, error = %e, "pty-reader: wait failed");
                        None
                    }
                };
                info!(terminal_id = %reader_id, exit_code = ?exit_code, "pty-reader: process exited");
                sink(PtyEvent::Exit {
                    terminal_id: reader_id,
                    exit_code,
                });
            })
            .map_err(|e| Error::Pty(format!("failed to spawn PTY reader thread: {}", e)))?;

        Ok(SpawnedPty {
            handle: Box::new(NativePty {
                terminal_id,
                master: pair.master,
                writer,
                killer,
                shutdown,
            }),
            shell: Some(shell.name),
        })
    }
}

/// Incremental UTF-8 decoding that holds back a multi-byte sequence split
/// across reads instead of replacing it.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(input);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid_up_to + len..];
                        }
                        None => {
                            self.carry = rest[valid_up_to..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever incomplete sequence is left at end of stream.
    pub fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_joins_split_multibyte_sequence() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "❯ ok".as_bytes();

        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..]);

        assert_eq!(first, "");
        assert_eq!(second, "❯ ok");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes_and_continues() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn decoder_flushes_truncated_tail_lossily() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'x', 0xE2, 0x9D]), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
