// ABOUTME: Single-client TCP transport; a new connection replaces the current one.
// ABOUTME: Events are best-effort: with no client attached they are dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maestro_protocol::{encode_line, Event};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{InboundQueue, LineBuffer, Transport};
use crate::config::Timings;
use crate::error::TransportError;
use crate::supervisor::join_or_abort;

/// The connected frontend, if any.
struct ClientConn {
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ClientConn {
    async fn close(mut self, join_timeout: Duration) {
        self.cancel.cancel();
        let _ = self.writer.shutdown().await;
        join_or_abort(self.task, join_timeout).await;
        tracing::info!(peer = %self.peer, "Frontend client disconnected");
    }
}

pub struct TcpTransport {
    host: String,
    port: u16,
    client: Arc<Mutex<Option<ClientConn>>>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    inbound: Arc<InboundQueue>,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    write_timeout: Duration,
    join_timeout: Duration,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16, timings: &Timings) -> Self {
        Self {
            host: host.into(),
            port,
            client: Arc::new(Mutex::new(None)),
            local_addr: std::sync::Mutex::new(None),
            inbound: Arc::new(InboundQueue::new()),
            cancel: CancellationToken::new(),
            accept_task: Mutex::new(None),
            write_timeout: timings.write_timeout(),
            join_timeout: timings.join_timeout(),
        }
    }

    /// Bound address once started (useful when configured with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Whether a frontend is currently connected.
    pub async fn has_client(&self) -> bool {
        self.client.lock().await.is_some()
    }

    async fn bind(&self) -> Result<TcpListener, TransportError> {
        let addr = format!("{}:{}", self.host, self.port);
        let bind_err = |source| TransportError::Bind {
            addr: addr.clone(),
            source,
        };

        let resolved = tokio::net::lookup_host(&addr)
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "host did not resolve",
                ))
            })?;

        let socket = if resolved.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(resolved).map_err(bind_err)?;
        socket.listen(1).map_err(bind_err)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.accept_task.lock().await.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let listener = self.bind().await?;
        let local = listener.local_addr()?;
        if let Ok(mut addr) = self.local_addr.lock() {
            *addr = Some(local);
        }

        let handle = tokio::spawn(accept_loop(
            listener,
            self.client.clone(),
            self.inbound.clone(),
            self.cancel.clone(),
            self.join_timeout,
        ));
        *self.accept_task.lock().await = Some(handle);

        tracing::info!(addr = %local, "TCP transport listening");
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.lock().await.take() {
            join_or_abort(task, self.join_timeout).await;
        }
        if let Some(conn) = self.client.lock().await.take() {
            conn.close(self.join_timeout).await;
        }
        self.inbound.drain().await;
        tracing::info!("TCP transport stopped");
    }

    async fn send_event(&self, event: &Event) {
        if self.cancel.is_cancelled() {
            return;
        }

        let mut client = self.client.lock().await;
        let Some(conn) = client.as_mut() else {
            tracing::trace!(event = event.type_name(), "No frontend connected, dropping event");
            return;
        };

        let line = match encode_line(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode event");
                return;
            }
        };

        let failure = match tokio::time::timeout(
            self.write_timeout,
            conn.writer.write_all(line.as_bytes()),
        )
        .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("write timed out".to_string()),
        };

        if let Some(reason) = failure {
            tracing::warn!(peer = %conn.peer, reason = %reason, "Dropping frontend client");
            if let Some(conn) = client.take() {
                conn.close(self.join_timeout).await;
            }
        }
    }

    fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }
}

async fn accept_loop(
    listener: TcpListener,
    client: Arc<Mutex<Option<ClientConn>>>,
    inbound: Arc<InboundQueue>,
    cancel: CancellationToken,
    join_timeout: Duration,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept frontend connection");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                continue;
            }
        };

        let mut slot = client.lock().await;
        if let Some(previous) = slot.take() {
            tracing::info!(old = %previous.peer, new = %peer, "Replacing frontend client");
            previous.close(join_timeout).await;
        }

        let (reader, writer) = stream.into_split();
        let conn_cancel = cancel.child_token();
        let task = tokio::spawn(read_client(
            reader,
            peer,
            inbound.clone(),
            client.clone(),
            conn_cancel.clone(),
        ));
        *slot = Some(ClientConn {
            peer,
            writer,
            cancel: conn_cancel,
            task,
        });
        tracing::info!(peer = %peer, "Frontend client connected");
    }
}

async fn read_client(
    mut reader: OwnedReadHalf,
    peer: SocketAddr,
    inbound: Arc<InboundQueue>,
    client: Arc<Mutex<Option<ClientConn>>>,
    cancel: CancellationToken,
) {
    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    inbound.push_line(&line, "tcp");
                }
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "Frontend read failed");
                break;
            }
        }
    }

    // The peer went away on its own; clear the slot unless it was already replaced.
    let mut slot = client.lock().await;
    if slot.as_ref().is_some_and(|conn| conn.peer == peer) {
        if let Some(conn) = slot.take() {
            conn.cancel.cancel();
            tracing::info!(peer = %peer, "Frontend client disconnected");
        }
    }
}
