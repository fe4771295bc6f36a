//! Tool Meister - run the registered tools on this host
//!
//! Waits for its parameter key to appear on the broker, then listens on the
//! command channel and answers every command with one status until told to
//! terminate.
//!
//! # Usage
//!
//! ```bash
//! # Run in the foreground
//! tool-meister tm-default-h1.example.com
//!
//! # Run as a background daemon
//! tool-meister -d tm-default-h1.example.com
//!
//! # Enable debug logging
//! _PBENCH_TOOL_MEISTER_LOG_LEVEL=debug tool-meister tm-default-h1.example.com
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: leave the command loop and exit

use std::env;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tm_core::{BrokerAddress, Kind, TmConfig};
use tm_protocol::RedisBroker;
use tmd::{fetch_params, CommandLoop, ScriptRunner, ToolMeister, ToolMeisterParams};

const PROG: &str = "tool-meister";
const LOG_LEVEL_ENV: &str = "_PBENCH_TOOL_MEISTER_LOG_LEVEL";
const INSTALL_DIR_ENV: &str = "pbench_install_dir";
const DEFAULT_INSTALL_DIR: &str = "/opt/pbench-agent";

/// Tool Meister - per-host tool coordinator
#[derive(Parser, Debug)]
#[command(name = "tool-meister", version, about)]
struct Args {
    /// Broker key holding this Tool Meister's parameters
    param_key: String,

    /// Broker location, `<host>[:<port>]` (overrides PBENCH_REDIS_SERVER)
    #[arg(long)]
    broker: Option<String>,

    /// Channel name prefix
    #[arg(long)]
    channel_prefix: Option<String>,

    /// Run as a background daemon (fork to background)
    #[arg(short = 'd', long)]
    daemon: bool,
}

/// Directory for the PID and log files: `<run_dir>/tm`, or the system
/// temporary directory when no run directory is configured.
fn state_dir(config: &TmConfig) -> PathBuf {
    config
        .run_dir
        .as_ref()
        .map(|dir| dir.join("tm"))
        .unwrap_or_else(env::temp_dir)
}

fn pid_file_path(config: &TmConfig, key: &str) -> PathBuf {
    state_dir(config).join(format!("{key}.pid"))
}

fn log_file_path(config: &TmConfig, key: &str) -> PathBuf {
    state_dir(config).join(format!("{key}.log"))
}

/// Writes the current PID to the PID file.
fn write_pid(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = TmConfig::load().context("Failed to load configuration")?;
    if let Some(spec) = &args.broker {
        config.broker = BrokerAddress::parse(spec).context("Invalid --broker")?;
    }
    if let Some(prefix) = &args.channel_prefix {
        config.channel_prefix = prefix.clone();
    }

    if args.daemon {
        // Daemonize before starting tokio runtime
        daemonize(&log_file_path(&config, &args.param_key))?;
    }

    let pid_file = pid_file_path(&config, &args.param_key);
    write_pid(&pid_file)?;

    let result = run(config, args.param_key);

    let _ = fs::remove_file(&pid_file);
    result
}

/// Daemonizes the current process, sending output to `log_path`.
fn daemonize(log_path: &Path) -> Result<()> {
    use daemonize::Daemonize;

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .umask(0o022)
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run(config: TmConfig, param_key: String) -> Result<()> {
    let level = match env::var(LOG_LEVEL_ENV) {
        Ok(level) if level == "debug" => "debug",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("tmd={level}").parse()?)
                .add_directive(format!("tm_protocol={level}").parse()?)
                .add_directive(format!("tm_core={level}").parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        key = %param_key,
        broker = %config.broker,
        "Tool Meister starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let broker = Arc::new(RedisBroker::new(config.broker.clone()));
    let raw = fetch_params(broker.as_ref(), &param_key, PROG, cancel_token.clone()).await?;
    let params = ToolMeisterParams::parse(&param_key, &raw)?;

    let install_dir = env::var(INSTALL_DIR_ENV).unwrap_or_else(|_| DEFAULT_INSTALL_DIR.to_string());
    let runner = ScriptRunner::new(&install_dir, params.tools.clone());

    let command_loop = CommandLoop::new(
        broker,
        config.channels(),
        Kind::ToolMeister,
        params.hostname.as_str(),
    )
    .group(params.group.as_str())
    .cancel_token(cancel_token);
    let mut tool_meister = ToolMeister::new(params, Box::new(runner));

    let summary = command_loop.run(&mut tool_meister).await?;
    info!(
        handled = summary.handled,
        rejected = summary.rejected,
        terminated = summary.terminated,
        state = %tool_meister.state(),
        "Tool Meister stopped"
    );
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
