// ABOUTME: Bridge manager: owns one transport and one supervisor and runs the coordination loop.
// ABOUTME: The loop is the only place commands become supervisor calls and child exits become restarts.

use std::sync::Arc;
use std::time::Duration;

use maestro_protocol::{Command, Event, Role};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::preview;
use crate::supervisor::{join_or_abort, ExitOutcome, Supervisor, SupervisorSignal};
use crate::transport::{create_transport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Everything owned for the duration of one `start()`..`stop()` cycle.
struct Run {
    transport: Arc<dyn Transport>,
    supervisor: Arc<Supervisor>,
    cancel: CancellationToken,
    coordinator: JoinHandle<()>,
}

pub struct BridgeManager {
    config: BridgeConfig,
    state: watch::Sender<BridgeState>,
    run: Mutex<Option<Run>>,
}

impl BridgeManager {
    pub fn new(config: BridgeConfig) -> Self {
        let (state, _) = watch::channel(BridgeState::Idle);
        Self {
            config,
            state,
            run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Build the configured transport, then start it and the agent.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let transport = create_transport(&self.config.transport, &self.config.timings)?;
        self.start_with_transport(transport).await
    }

    /// Start with a caller-supplied transport.
    ///
    /// Transport setup errors are returned and leave the manager Idle. An agent
    /// that fails to spawn does not: the transport stays up and the failure is
    /// sent to the frontend as an error event.
    pub async fn start_with_transport(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<(), BridgeError> {
        let mut run = self.run.lock().await;
        if run.is_some() || self.state() != BridgeState::Idle {
            return Err(BridgeError::AlreadyRunning);
        }
        self.state.send_replace(BridgeState::Starting);

        tracing::info!(
            transport = transport.name(),
            agent = %self.config.agent.executable,
            "Starting bridge"
        );

        if let Err(e) = transport.start().await {
            tracing::error!(transport = transport.name(), error = %e, "Transport failed to start");
            self.state.send_replace(BridgeState::Idle);
            return Err(e.into());
        }

        let (sink, signals) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Supervisor::new(
            self.config.agent.clone(),
            self.config.timings.clone(),
            sink,
        ));

        if let Err(e) = supervisor.start().await {
            tracing::error!(error = %e, "Agent failed to start; bridge stays up without it");
            transport
                .send_event(&Event::error(format!("failed to start agent: {e}")))
                .await;
        }

        let cancel = CancellationToken::new();
        let coordinator = tokio::spawn(coordinate(
            transport.clone(),
            supervisor.clone(),
            signals,
            cancel.clone(),
            self.config.timings.poll_interval(),
        ));

        *run = Some(Run {
            transport,
            supervisor,
            cancel,
            coordinator,
        });
        self.state.send_replace(BridgeState::Running);
        tracing::info!("Bridge running");
        Ok(())
    }

    /// Stop the coordination loop, then the agent, then the transport.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(current) = run.take() else {
            return;
        };
        self.state.send_replace(BridgeState::Stopping);
        tracing::info!("Stopping bridge");

        current.cancel.cancel();
        // The loop may be in the middle of a restart, which can take a full grace period.
        let budget = self.config.timings.join_timeout() + self.config.timings.stop_grace();
        join_or_abort(current.coordinator, budget).await;

        current.supervisor.stop().await;
        current.transport.stop().await;

        self.state.send_replace(BridgeState::Idle);
        tracing::info!("Bridge stopped");
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == BridgeState::Running
    }

    /// Supervisor of the current run, if any.
    pub async fn supervisor(&self) -> Option<Arc<Supervisor>> {
        self.run.lock().await.as_ref().map(|run| run.supervisor.clone())
    }

    /// Transport of the current run, if any.
    pub async fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.run.lock().await.as_ref().map(|run| run.transport.clone())
    }
}

async fn coordinate(
    transport: Arc<dyn Transport>,
    supervisor: Arc<Supervisor>,
    mut signals: mpsc::UnboundedReceiver<SupervisorSignal>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    loop {
        // Commands already queued go first so a stream of agent events
        // cannot hold back an interrupt.
        while let Some(command) = transport.receive_command(None).await {
            dispatch(&supervisor, command).await;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(signal) = signals.recv() => match signal {
                SupervisorSignal::Event(event) => {
                    log_forwarded(&event);
                    transport.send_event(&event).await;
                }
                SupervisorSignal::ChildExited { generation } => {
                    let outcome = supervisor.handle_child_exit(generation).await;
                    if outcome != ExitOutcome::Stale {
                        tracing::info!(?outcome, generation, "Handled agent exit");
                    }
                }
            },
            command = transport.receive_command(Some(poll_interval)) => {
                if let Some(command) = command {
                    dispatch(&supervisor, command).await;
                }
            }
        }
    }
    tracing::debug!("Coordination loop exited");
}

async fn dispatch(supervisor: &Supervisor, command: Command) {
    let kind = command.type_name();
    let delivered = match command {
        Command::UserInput { content } => supervisor.send_user_input(content).await,
        Command::ToolApproval { tool_id, approved } => {
            supervisor.send_tool_approval(tool_id, approved).await
        }
        Command::Interrupt => supervisor.send_interrupt().await,
        Command::ModelSwitch { model_id } => supervisor.send_model_switch(model_id).await,
    };
    if !delivered {
        tracing::debug!(command = kind, "Command not delivered to agent");
    }
}

fn log_forwarded(event: &Event) {
    match event {
        Event::Conversation {
            role: Role::Assistant,
            content,
            ..
        } => tracing::debug!(preview = %preview(content, 100), "Assistant"),
        Event::ToolGroup { id, tools } => {
            tracing::debug!(id, tools = tools.len(), "Tool group")
        }
        Event::Error { message, id } => tracing::warn!(id, message = %message, "Agent error"),
        other => tracing::trace!(event = other.type_name(), "Forwarding event"),
    }
}
