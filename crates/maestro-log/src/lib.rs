// ABOUTME: Shared logging setup for all maestro binaries
// ABOUTME: stdout carries the bridge protocol in stdio mode, so every writer here is stderr or a file

use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Standard logging to stderr. Default: INFO level, RUST_LOG override.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .try_init();
}

/// File-based logging for sessions where stderr is also taken (e.g. a TUI
/// frontend embedding the bridge). Default: WARN level, RUST_LOG override.
/// Logs to ~/.config/maestro/{app_name}/{app_name}.log
/// If setup fails, prints a warning to stderr and continues without logging.
pub fn init_file(app_name: &str) {
    if let Err(e) = init_file_inner(app_name) {
        eprintln!("Warning: failed to set up file logging: {e}");
    }
}

/// Directory holding the log file for `app_name`.
pub fn log_dir(app_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("maestro").join(app_name))
}

fn init_file_inner(app_name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let log_dir = log_dir(app_name).ok_or("could not determine config directory")?;
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("{app_name}.log")))?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .with_ansi(false)
        .try_init()?;

    Ok(())
}

/// Crate-filtered logging to stderr. Default: `level` for the named crate,
/// WARN for everything else.
pub fn init_for(crate_name: &str, level: tracing::Level) {
    let directive = format!("{crate_name}={level}");
    let filter = EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into())
        .add_directive(
            directive
                .parse()
                .unwrap_or_else(|_| tracing::Level::INFO.into()),
        );

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
