// ABOUTME: Owns the agent subprocess: spawn, command writer, event reader, stop and restart.
// ABOUTME: Exit handling is an explicit state transition driven by the caller, never by the reader task.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use maestro_protocol::{decode_event, encode_line, Command, Event};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, Timings};
use crate::error::SupervisorError;
use crate::preview;

/// What the supervisor publishes to whoever drives it.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorSignal {
    /// A decoded line from the agent's stdout (or an error raised by the supervisor itself).
    Event(Event),
    /// The agent identified by `generation` closed its stdout.
    ChildExited { generation: u64 },
}

/// Receiving end is held by the bridge manager's coordination loop.
pub type EventSink = mpsc::UnboundedSender<SupervisorSignal>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Never started
    Idle,
    Running,
    /// Between stopping the old child and spawning the new one
    Restarting,
    /// Stopped on request, after a non-restartable exit, or after a failed spawn
    Stopped,
    /// `max_restarts` used up; no further automatic restarts
    Exhausted,
}

/// Result of [`Supervisor::handle_child_exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// A replacement child is running.
    Restarted,
    /// Auto-restart is off, or the replacement failed to spawn.
    Stopped,
    /// Restart budget used up.
    Exhausted,
    /// The exit belonged to a child that had already been replaced or stopped.
    Stale,
}

/// One spawned child plus the tasks servicing its pipes.
struct ChildRun {
    child: Child,
    pid: Option<u32>,
    generation: u64,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<Command>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    run: Option<ChildRun>,
    generation: u64,
}

/// Supervises a single agent subprocess.
///
/// The child handle is only ever replaced under `inner`, so `send`, `stop`,
/// `restart` and `handle_child_exit` serialize against each other.
pub struct Supervisor {
    agent: AgentConfig,
    timings: Timings,
    sink: EventSink,
    inner: Mutex<Inner>,
    restart_count: AtomicU32,
    last_error: StdMutex<String>,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(agent: AgentConfig, timings: Timings, sink: EventSink) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            agent,
            timings,
            sink,
            inner: Mutex::new(Inner {
                run: None,
                generation: 0,
            }),
            restart_count: AtomicU32::new(0),
            last_error: StdMutex::new(String::new()),
            state,
        }
    }

    /// Spawn the agent and its writer, reader and stderr tasks.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        if inner.run.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        match self.spawn_locked(&mut inner) {
            Ok(()) => {
                self.set_state(SupervisorState::Running);
                Ok(())
            }
            Err(e) => {
                self.record_error(e.to_string());
                self.set_state(SupervisorState::Stopped);
                Err(e)
            }
        }
    }

    /// Queue a command for the agent. Returns false (and records `last_error`)
    /// when no agent is running.
    pub async fn send(&self, command: Command) -> bool {
        let inner = self.inner.lock().await;
        let Some(run) = inner.run.as_ref() else {
            self.record_error("agent not running");
            tracing::warn!(command = command.type_name(), "Dropping command: agent not running");
            return false;
        };
        if run.outbound.send(command).is_err() {
            self.record_error("agent writer has stopped");
            tracing::warn!(pid = ?run.pid, "Dropping command: agent writer has stopped");
            return false;
        }
        true
    }

    pub async fn send_user_input(&self, content: impl Into<String>) -> bool {
        self.send(Command::user_input(content)).await
    }

    pub async fn send_tool_approval(&self, tool_id: impl Into<String>, approved: bool) -> bool {
        self.send(Command::tool_approval(tool_id, approved)).await
    }

    pub async fn send_interrupt(&self) -> bool {
        self.send(Command::Interrupt).await
    }

    pub async fn send_model_switch(&self, model_id: impl Into<String>) -> bool {
        self.send(Command::model_switch(model_id)).await
    }

    /// Terminate the agent (SIGTERM, then kill after the grace period) and
    /// join its tasks. No-op when nothing is running.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.run.is_none() {
            return;
        }
        self.stop_locked(&mut inner).await;
        if self.state() != SupervisorState::Exhausted {
            self.set_state(SupervisorState::Stopped);
        }
    }

    /// Stop the current child and spawn a fresh one with the same parameters.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        self.restart_locked(&mut inner).await
    }

    /// Apply the exit policy for the child identified by `generation`.
    pub async fn handle_child_exit(&self, generation: u64) -> ExitOutcome {
        let mut inner = self.inner.lock().await;
        let current = inner.run.as_ref().map(|run| run.generation);
        if current != Some(generation) {
            tracing::debug!(generation, ?current, "Ignoring exit of a replaced agent");
            return ExitOutcome::Stale;
        }

        if !self.agent.auto_restart {
            let pid = inner.run.as_ref().and_then(|run| run.pid);
            self.stop_locked(&mut inner).await;
            self.set_state(SupervisorState::Stopped);
            self.record_error("agent process exited");
            tracing::warn!(pid = ?pid, "Agent closed stdout; auto-restart disabled");
            self.publish(Event::error("agent process exited"));
            return ExitOutcome::Stopped;
        }

        tracing::info!(
            attempt = self.restart_count() + 1,
            max = self.agent.max_restarts,
            "Agent closed stdout; restarting"
        );
        match self.restart_locked(&mut inner).await {
            Ok(()) => ExitOutcome::Restarted,
            Err(SupervisorError::RestartExhausted) => ExitOutcome::Exhausted,
            Err(e) => {
                self.publish(Event::error(format!("failed to restart agent: {e}")));
                ExitOutcome::Stopped
            }
        }
    }

    /// True iff a child exists and the OS still reports it alive.
    pub async fn is_running(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.run.as_mut() {
            Some(run) => matches!(run.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.run.as_ref().and_then(|run| run.pid)
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch state transitions (Running, Restarting, Exhausted, ...).
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    async fn restart_locked(&self, inner: &mut Inner) -> Result<(), SupervisorError> {
        if self.restart_count() >= self.agent.max_restarts {
            self.stop_locked(inner).await;
            self.record_error(SupervisorError::RestartExhausted.to_string());
            self.set_state(SupervisorState::Exhausted);
            tracing::error!(
                restarts = self.restart_count(),
                "Agent restart limit exceeded, giving up"
            );
            self.publish(Event::error(format!(
                "agent restart limit exceeded after {} restarts",
                self.restart_count()
            )));
            return Err(SupervisorError::RestartExhausted);
        }

        self.set_state(SupervisorState::Restarting);
        self.stop_locked(inner).await;
        self.restart_count.fetch_add(1, Ordering::SeqCst);

        match self.spawn_locked(inner) {
            Ok(()) => {
                self.set_state(SupervisorState::Running);
                Ok(())
            }
            Err(e) => {
                self.record_error(e.to_string());
                self.set_state(SupervisorState::Stopped);
                Err(e)
            }
        }
    }

    fn spawn_locked(&self, inner: &mut Inner) -> Result<(), SupervisorError> {
        let (program, args) = self
            .agent
            .command_line()
            .ok_or(SupervisorError::EmptyCommand)?;

        tracing::info!(program = %program, args = ?args, "Starting agent subprocess");

        let mut cmd = ProcessCommand::new(&program);
        cmd.args(&args)
            .envs(&self.agent.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.agent.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|source| SupervisorError::Spawn { program, source })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SupervisorError::MissingPipe("stderr"))?;

        inner.generation += 1;
        let generation = inner.generation;
        let pid = child.id();
        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(write_commands(stdin, outbound_rx, cancel.clone(), pid)),
            tokio::spawn(read_events(
                stdout,
                self.sink.clone(),
                cancel.clone(),
                generation,
                pid,
            )),
            tokio::spawn(drain_stderr(stderr, cancel.clone(), pid)),
        ];

        tracing::info!(pid = ?pid, generation, "Agent subprocess started");

        inner.run = Some(ChildRun {
            child,
            pid,
            generation,
            cancel,
            outbound,
            tasks,
        });
        Ok(())
    }

    async fn stop_locked(&self, inner: &mut Inner) {
        let Some(mut run) = inner.run.take() else {
            return;
        };
        tracing::info!(pid = ?run.pid, "Stopping agent subprocess");

        run.cancel.cancel();
        drop(run.outbound);
        terminate(&mut run.child, self.timings.stop_grace()).await;

        for task in run.tasks {
            join_or_abort(task, self.timings.join_timeout()).await;
        }
        tracing::debug!(pid = ?run.pid, "Agent subprocess stopped");
    }

    fn publish(&self, event: Event) {
        // Only fails once the bridge manager has gone away.
        let _ = self.sink.send(SupervisorSignal::Event(event));
    }

    fn record_error(&self, message: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = message.into();
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }
}

/// Writer task: one encoded line per command, flushed after each write.
async fn write_commands(
    mut stdin: ChildStdin,
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    pid: Option<u32>,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let line = match encode_line(&command) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode command");
                continue;
            }
        };
        tracing::debug!(pid = ?pid, line = %preview(line.trim_end(), 200), "Sending to agent");

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(pid = ?pid, error = %e, "Failed to write to agent stdin");
            break;
        }
    }
}

/// Reader task: decode stdout lines into events; report EOF, never restart.
/// Bytes are decoded lossily, so invalid UTF-8 is just another bad line.
async fn read_events(
    stdout: ChildStdout,
    sink: EventSink,
    cancel: CancellationToken,
    generation: u64,
    pid: Option<u32>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                tracing::info!(pid = ?pid, "Agent closed stdout");
                break;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                tracing::debug!(pid = ?pid, line = %preview(trimmed, 200), "Received from agent");
                match decode_event(trimmed) {
                    Ok(event) => {
                        if sink.send(SupervisorSignal::Event(event)).is_err() {
                            tracing::debug!("Event sink closed, stopping reader");
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            pid = ?pid,
                            error = %e,
                            line = %preview(trimmed, 200),
                            "Dropping unparseable agent output"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(pid = ?pid, error = %e, "Failed to read agent stdout");
                break;
            }
        }
    }

    if !cancel.is_cancelled() {
        let _ = sink.send(SupervisorSignal::ChildExited { generation });
    }
}

/// Agent stderr is diagnostics only.
async fn drain_stderr(stderr: ChildStderr, cancel: CancellationToken, pid: Option<u32>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::debug!(pid = ?pid, stderr = %line, "Agent stderr");
                }
            }
        }
    }
}

async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(status = %status, "Agent had already exited");
        return;
    }

    if let Err(e) = send_terminate(child) {
        tracing::debug!(error = %e, "Failed to signal agent, killing instead");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(status = %status, "Agent exited"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for agent"),
        Err(_) => {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "Agent did not respond to terminate, sending kill"
            );
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill agent");
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

pub(crate) async fn join_or_abort(mut task: JoinHandle<()>, timeout: Duration) {
    if tokio::time::timeout(timeout, &mut task).await.is_err() {
        tracing::debug!("Background task did not finish in time, aborting");
        task.abort();
    }
}
