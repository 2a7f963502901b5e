// ABOUTME: Stdio transport: frontend commands on the bridge's stdin, events on its stdout.
// ABOUTME: Generic over the byte streams so tests can drive it through in-memory duplex pipes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maestro_protocol::{encode_line, Event};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{FramedWriter, InboundQueue, LineBuffer, Transport, WriteOutcome};
use crate::config::Timings;
use crate::error::TransportError;
use crate::supervisor::join_or_abort;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StdioTransport {
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<FramedWriter<BoxedWriter>>,
    inbound: Arc<InboundQueue>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    write_timeout: Duration,
    join_timeout: Duration,
}

impl StdioTransport {
    /// Transport over the process's own stdin and stdout.
    pub fn new(timings: &Timings) -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout(), timings)
    }

    pub fn with_io<R, W>(reader: R, writer: W, timings: &Timings) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(FramedWriter::new(Box::new(writer))),
            inbound: Arc::new(InboundQueue::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            write_timeout: timings.write_timeout(),
            join_timeout: timings.join_timeout(),
        }
    }

    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn name(&self) -> &'static str {
        "stdin"
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(TransportError::AlreadyStarted)?;

        let inbound = self.inbound.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            let mut chunk = [0u8; 4096];
            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = reader.read(&mut chunk) => read,
                };
                match read {
                    Ok(0) => {
                        tracing::info!("Frontend closed stdin");
                        break;
                    }
                    Ok(n) => {
                        for line in lines.push(&chunk[..n]) {
                            inbound.push_line(&line, "stdin");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);

        tracing::info!("Stdio transport started");
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            join_or_abort(task, self.join_timeout).await;
        }
        let dropped = self.inbound.drain().await;
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded pending frontend commands");
        }
        tracing::info!("Stdio transport stopped");
    }

    async fn send_event(&self, event: &Event) {
        if !self.is_running() {
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
        match writer.write_line(line.as_bytes(), self.write_timeout).await {
            Ok(WriteOutcome::Written) => {}
            Ok(WriteOutcome::Backlogged) => tracing::warn!(
                event = event.type_name(),
                backlog = writer.backlog(),
                "Timed out writing to stdout, holding the rest for the next event"
            ),
            Ok(WriteOutcome::Dropped) => tracing::warn!(
                event = event.type_name(),
                "stdout backlog full, dropping event"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to write event to stdout"),
        }
    }

    fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }
}
