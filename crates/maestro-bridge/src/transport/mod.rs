// ABOUTME: Frontend transport abstraction shared by the stdio, pipe and TCP channels.
// ABOUTME: Inbound lines are decoded into a pending command queue; outbound events are written as JSON lines.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maestro_protocol::{decode_command, Command, Event};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::config::{Timings, TransportConfig, TransportMode};
use crate::error::{BridgeError, TransportError};
use crate::preview;

#[cfg(unix)]
pub mod pipe;
pub mod stdio;
pub mod tcp;

#[cfg(unix)]
pub use pipe::PipeTransport;
pub use stdio::StdioTransport;
pub use tcp::TcpTransport;

/// Frontend-facing side of the bridge.
///
/// `start` must fail fast (missing FIFO, bind failure) before any background
/// task is spawned. After `start`, decoded commands accumulate in
/// [`Transport::inbound`] until consumed through `receive_command`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs ("stdin", "pipe", "tcp").
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<(), TransportError>;

    /// Stop background tasks, close owned handles and discard pending commands.
    async fn stop(&self);

    /// Write one event as a JSON line. Failures are logged, never returned.
    async fn send_event(&self, event: &Event);

    async fn send_events(&self, events: &[Event]) {
        for event in events {
            self.send_event(event).await;
        }
    }

    fn inbound(&self) -> &InboundQueue;

    /// Pop the next pending command. `None` timeout never blocks; `Some(t)`
    /// waits at most `t`.
    async fn receive_command(&self, timeout: Option<Duration>) -> Option<Command> {
        self.inbound().pop(timeout).await
    }
}

/// FIFO of decoded frontend commands. Safe to push from any reader task.
pub struct InboundQueue {
    tx: mpsc::UnboundedSender<Command>,
    rx: Mutex<mpsc::UnboundedReceiver<Command>>,
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn push(&self, command: Command) {
        // The receiver lives as long as self, so this cannot fail.
        let _ = self.tx.send(command);
    }

    /// Decode one inbound line. Malformed lines are logged and dropped.
    pub fn push_line(&self, line: &str, source: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        match decode_command(line) {
            Ok(command) => {
                tracing::debug!(source, command = command.type_name(), "Queued frontend command");
                self.push(command);
                true
            }
            Err(e) => {
                tracing::warn!(
                    source,
                    error = %e,
                    line = %preview(line, 200),
                    "Dropping malformed frontend line"
                );
                false
            }
        }
    }

    pub async fn pop(&self, timeout: Option<Duration>) -> Option<Command> {
        let mut rx = self.rx.lock().await;
        match timeout {
            None => rx.try_recv().ok(),
            Some(timeout) => tokio::time::timeout(timeout, rx.recv())
                .await
                .ok()
                .flatten(),
        }
    }

    /// Discard everything still queued; returns how many commands were dropped.
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Accumulates raw bytes and yields complete newline-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

/// A frontend that never sends a newline should not grow the buffer forever.
const MAX_PARTIAL_LINE: usize = 16 * 1024 * 1024;

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every completed line, trimmed and non-empty.
    /// Any trailing partial line stays buffered.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }

        if self.buf.len() > MAX_PARTIAL_LINE {
            tracing::warn!(bytes = self.buf.len(), "Discarding oversized partial line");
            self.buf.clear();
        }
        lines
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// How a [`FramedWriter::write_line`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The line (and any earlier backlog) reached the peer.
    Written,
    /// Timed out; the unwritten tail is kept and finished before the next line.
    Backlogged,
    /// The backlog was full, so this line was discarded whole.
    Dropped,
}

/// Upper bound on bytes held back for a stalled reader.
const MAX_BACKLOG: usize = 1024 * 1024;

/// Line writer that never lets a timed-out partial line be followed by the
/// start of another one.
pub struct FramedWriter<W> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    /// Bytes accepted but not yet written.
    pub fn backlog(&self) -> usize {
        self.pending.len()
    }

    /// Queue `line` behind any backlog and write for at most `timeout`.
    /// On an I/O error the backlog is discarded.
    pub async fn write_line(
        &mut self,
        line: &[u8],
        timeout: Duration,
    ) -> std::io::Result<WriteOutcome> {
        let accepted = self.pending.len() < MAX_BACKLOG;
        if accepted {
            self.pending.extend_from_slice(line);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.pending.is_empty() {
            let written = tokio::time::timeout_at(deadline, self.inner.write(&self.pending)).await;
            match written {
                Err(_) => {
                    return Ok(if accepted {
                        WriteOutcome::Backlogged
                    } else {
                        WriteOutcome::Dropped
                    });
                }
                Ok(Ok(0)) => {
                    self.pending.clear();
                    return Err(std::io::ErrorKind::WriteZero.into());
                }
                Ok(Ok(n)) => {
                    self.pending.drain(..n);
                }
                Ok(Err(e)) => {
                    self.pending.clear();
                    return Err(e);
                }
            }
        }

        if let Ok(Err(e)) = tokio::time::timeout_at(deadline, self.inner.flush()).await {
            return Err(e);
        }
        Ok(if accepted {
            WriteOutcome::Written
        } else {
            WriteOutcome::Dropped
        })
    }
}

/// Build the transport selected by `config`. Only validates; nothing is opened
/// until `start`.
pub fn create_transport(
    config: &TransportConfig,
    timings: &Timings,
) -> Result<Arc<dyn Transport>, BridgeError> {
    config.validate()?;
    match config.mode {
        TransportMode::Stdin => Ok(Arc::new(StdioTransport::new(timings))),
        TransportMode::Tcp => Ok(Arc::new(TcpTransport::new(
            config.host.clone(),
            config.port,
            timings,
        ))),
        #[cfg(unix)]
        TransportMode::Pipe => {
            let base = config
                .pipe_path
                .clone()
                .ok_or_else(|| BridgeError::Config("pipe mode requires a pipe path".to_string()))?;
            Ok(Arc::new(PipeTransport::new(base, timings)))
        }
        #[cfg(not(unix))]
        TransportMode::Pipe => Err(BridgeError::Config(
            "pipe transport is only available on unix".to_string(),
        )),
    }
}
