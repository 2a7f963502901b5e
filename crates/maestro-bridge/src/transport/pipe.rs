// ABOUTME: Named-pipe transport over a pre-created FIFO pair `<base>.in` / `<base>.out`.
// ABOUTME: The bridge reads commands from `.in` and writes events to `.out`; the frontend does the reverse.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maestro_protocol::{encode_line, Event};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{FramedWriter, InboundQueue, LineBuffer, Transport, WriteOutcome};
use crate::config::Timings;
use crate::error::TransportError;
use crate::supervisor::join_or_abort;

pub struct PipeTransport {
    input_path: PathBuf,
    output_path: PathBuf,
    writer: Mutex<Option<FramedWriter<pipe::Sender>>>,
    inbound: Arc<InboundQueue>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
    write_timeout: Duration,
    join_timeout: Duration,
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl PipeTransport {
    pub fn new(base: impl Into<PathBuf>, timings: &Timings) -> Self {
        let base = base.into();
        Self {
            input_path: with_suffix(&base, ".in"),
            output_path: with_suffix(&base, ".out"),
            writer: Mutex::new(None),
            inbound: Arc::new(InboundQueue::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            poll_interval: timings.poll_interval(),
            write_timeout: timings.write_timeout(),
            join_timeout: timings.join_timeout(),
        }
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

// Opening both ends read-write keeps the FIFO open with or without a peer, so
// neither open blocks and the reader never sees EOF between frontend sessions.
#[cfg(target_os = "linux")]
fn open_pipes(input: &Path, output: &Path) -> std::io::Result<(pipe::Receiver, pipe::Sender)> {
    let receiver = pipe::OpenOptions::new().read_write(true).open_receiver(input)?;
    let sender = pipe::OpenOptions::new().read_write(true).open_sender(output)?;
    Ok((receiver, sender))
}

#[cfg(not(target_os = "linux"))]
fn open_pipes(input: &Path, output: &Path) -> std::io::Result<(pipe::Receiver, pipe::Sender)> {
    let receiver = pipe::OpenOptions::new().open_receiver(input)?;
    let sender = pipe::OpenOptions::new().open_sender(output)?;
    Ok((receiver, sender))
}

#[async_trait]
impl Transport for PipeTransport {
    fn name(&self) -> &'static str {
        "pipe"
    }

    async fn start(&self) -> Result<(), TransportError> {
        for path in [&self.input_path, &self.output_path] {
            if !path.exists() {
                return Err(TransportError::PathNotFound { path: path.clone() });
            }
        }
        if self.task.lock().await.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let (mut receiver, sender) = open_pipes(&self.input_path, &self.output_path)?;
        *self.writer.lock().await = Some(FramedWriter::new(sender));

        let inbound = self.inbound.clone();
        let cancel = self.cancel.clone();
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            let mut chunk = [0u8; 4096];
            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = receiver.read(&mut chunk) => read,
                };
                match read {
                    Ok(0) => {
                        // Writer side closed; wait for the next frontend.
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    Ok(n) => {
                        for line in lines.push(&chunk[..n]) {
                            inbound.push_line(&line, "pipe");
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                        tokio::time::sleep(poll_interval).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read command pipe");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);

        tracing::info!(
            input = %self.input_path.display(),
            output = %self.output_path.display(),
            "Pipe transport started"
        );
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            join_or_abort(task, self.join_timeout).await;
        }
        self.writer.lock().await.take();
        self.inbound.drain().await;
        tracing::info!("Pipe transport stopped");
    }

    async fn send_event(&self, event: &Event) {
        if self.cancel.is_cancelled() {
            return;
        }
        let line = match encode_line(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode event");
                return;
            }
        };

        let mut writer = self.writer.lock().await;
        let Some(sender) = writer.as_mut() else {
            return;
        };
        match sender.write_line(line.as_bytes(), self.write_timeout).await {
            Ok(WriteOutcome::Written) => {}
            Ok(WriteOutcome::Backlogged) => tracing::warn!(
                event = event.type_name(),
                backlog = sender.backlog(),
                "Timed out writing event pipe (is a reader attached?)"
            ),
            Ok(WriteOutcome::Dropped) => tracing::warn!(
                event = event.type_name(),
                "Event pipe backlog full, dropping event"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to write event pipe"),
        }
    }

    fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }
}
