// ABOUTME: maestro-bridge binary - runs the bridge until Ctrl-C
// ABOUTME: Config file values are overridden by command-line flags

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use maestro_bridge::{BridgeConfig, BridgeManager, TransportMode};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "maestro-bridge")]
#[command(about = "Bridge a frontend to a supervised coding agent over stdin, pipes or TCP")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Transport the frontend uses
    #[arg(short, long, value_enum, env = "MAESTRO_MODE")]
    mode: Option<TransportMode>,

    /// FIFO base path for pipe mode (reads <base>.in, writes <base>.out)
    #[arg(long)]
    pipe_path: Option<PathBuf>,

    /// Host to listen on in tcp mode
    #[arg(long)]
    tcp_host: Option<String>,

    /// Port to listen on in tcp mode
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Agent command line (e.g. "npx qwen-code")
    #[arg(short, long, env = "MAESTRO_AGENT")]
    agent: Option<String>,

    /// Argument passed to the agent; replaces the configured list (repeatable)
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    /// Extra environment variable for the agent (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Agent working directory
    #[arg(short, long)]
    working_dir: Option<PathBuf>,

    /// Do not restart the agent when it exits
    #[arg(long)]
    no_auto_restart: bool,

    /// Maximum number of agent restarts
    #[arg(long)]
    max_restarts: Option<u32>,

    /// Load configuration from a file (default: ~/.config/maestro/bridge.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write logs to ~/.config/maestro/bridge/bridge.log instead of stderr
    #[arg(long)]
    log_file: bool,

    /// Log protocol traffic and agent stderr (debug level for the bridge)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file if none exists and print its path
    InitConfig,
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

impl Cli {
    fn apply(self, mut config: BridgeConfig) -> BridgeConfig {
        if let Some(mode) = self.mode {
            config.transport.mode = mode;
        }
        if let Some(path) = self.pipe_path {
            config.transport.pipe_path = Some(path);
        }
        if let Some(host) = self.tcp_host {
            config.transport.host = host;
        }
        if let Some(port) = self.tcp_port {
            config.transport.port = port;
        }
        if let Some(agent) = self.agent {
            config.agent.executable = agent;
        }
        if !self.agent_args.is_empty() {
            config.agent.args = self.agent_args;
        }
        config.agent.env.extend(self.env);
        if let Some(dir) = self.working_dir {
            config.agent.working_dir = Some(dir);
        }
        if self.no_auto_restart {
            config.agent.auto_restart = false;
        }
        if let Some(max) = self.max_restarts {
            config.agent.max_restarts = max;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.log_file {
        maestro_log::init_file("bridge");
    } else if cli.verbose {
        maestro_log::init_for("maestro_bridge", tracing::Level::DEBUG);
    } else {
        maestro_log::init();
    }

    if let Some(Commands::InitConfig) = cli.command {
        let path = BridgeConfig::init()?;
        eprintln!("Config: {}", path.display());
        return Ok(());
    }

    let base = match &cli.config {
        Some(path) => BridgeConfig::load_from(path)?,
        None => BridgeConfig::load()?,
    };
    let config = cli.apply(base);
    if let Err(e) = config.validate() {
        bail!("{e}");
    }

    tracing::info!(
        mode = %config.transport.mode,
        agent = %config.agent.executable,
        auto_restart = config.agent.auto_restart,
        max_restarts = config.agent.max_restarts,
        "maestro-bridge starting"
    );

    let manager = BridgeManager::new(config);
    manager
        .start()
        .await
        .context("Failed to start bridge")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Interrupt received, shutting down");

    manager.stop().await;
    Ok(())
}
