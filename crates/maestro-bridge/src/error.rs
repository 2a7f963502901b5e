// ABOUTME: Error types for the agent bridge.
// ABOUTME: Setup failures are returned to callers; runtime failures become logs or Error events.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the child supervisor.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The agent executable could not be located or launched.
    #[error("failed to spawn agent '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The configured agent command line is blank.
    #[error("agent command line is empty")]
    EmptyCommand,

    /// The spawned child did not expose one of its standard streams.
    #[error("agent process has no {0} pipe")]
    MissingPipe(&'static str),

    /// A child is already being supervised.
    #[error("agent is already running")]
    AlreadyRunning,

    /// The operation needs a live child.
    #[error("agent is not running")]
    NotRunning,

    /// `max_restarts` has been used up.
    #[error("restart limit exceeded")]
    RestartExhausted,
}

/// Errors raised while setting up a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A FIFO the pipe transport needs has not been created.
    #[error("pipe {} does not exist. Create with: mkfifo {}", .path.display(), .path.display())]
    PathNotFound { path: PathBuf },

    /// The TCP listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// `start()` was called twice.
    #[error("transport already started")]
    AlreadyStarted,

    /// Any other I/O failure while opening the channel.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the bridge manager.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("agent supervisor failed: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("bridge is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    Config(String),
}
