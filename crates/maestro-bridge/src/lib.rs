// ABOUTME: Maestro agent bridge library.
// ABOUTME: Supervises a coding-agent subprocess and relays its JSON-lines protocol to a frontend.

pub mod config;
pub mod error;
pub mod manager;
pub mod supervisor;
pub mod transport;

pub use config::{AgentConfig, BridgeConfig, Timings, TransportConfig, TransportMode};
pub use error::{BridgeError, SupervisorError, TransportError};
pub use manager::{BridgeManager, BridgeState};
pub use supervisor::{EventSink, ExitOutcome, Supervisor, SupervisorSignal, SupervisorState};
pub use transport::{create_transport, InboundQueue, Transport};

/// Truncate a line for logging, respecting char boundaries.
pub(crate) fn preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}
