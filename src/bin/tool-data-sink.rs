//! Tool Data Sink - central receiver of tool data
//!
//! Runs on the controller next to the client. Waits for its parameter key,
//! then answers every command with one status until told to terminate.
//!
//! # Usage
//!
//! ```bash
//! tool-data-sink tds
//! RUST_LOG=tmd=debug tool-data-sink --broker localhost:17001 tds
//! ```

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tm_core::{BrokerAddress, Kind, TmConfig};
use tm_protocol::RedisBroker;
use tmd::{fetch_params, CommandLoop, DataSink, DataSinkParams};

const PROG: &str = "tool-data-sink";
const LOG_LEVEL_ENV: &str = "_PBENCH_TOOL_MEISTER_LOG_LEVEL";

/// Tool Data Sink - central receiver of tool data
#[derive(Parser, Debug)]
#[command(name = "tool-data-sink", version, about)]
struct Args {
    /// Broker key holding the data sink's parameters
    #[arg(default_value = "tds")]
    param_key: String,

    /// Broker location, `<host>[:<port>]` (overrides PBENCH_REDIS_SERVER)
    #[arg(long)]
    broker: Option<String>,

    /// Channel name prefix
    #[arg(long)]
    channel_prefix: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = TmConfig::load().context("Failed to load configuration")?;
    if let Some(spec) = &args.broker {
        config.broker = BrokerAddress::parse(spec).context("Invalid --broker")?;
    }
    if let Some(prefix) = args.channel_prefix {
        config.channel_prefix = prefix;
    }

    run(config, args.param_key)
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
                .add_directive(format!("tm_protocol={level}").parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        key = %param_key,
        "Tool Data Sink starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            shutdown_token.cancel();
        }
    });

    let broker = Arc::new(RedisBroker::new(config.broker.clone()));
    let raw = fetch_params(broker.as_ref(), &param_key, PROG, cancel_token.clone()).await?;
    let params = DataSinkParams::parse(&param_key, &raw)?;

    let command_loop = CommandLoop::new(
        broker,
        config.channels(),
        Kind::DataSink,
        params.hostname.as_str(),
    )
    .cancel_token(cancel_token);
    let mut data_sink = DataSink::new(params);

    let summary = command_loop.run(&mut data_sink).await?;
    info!(
        handled = summary.handled,
        terminated = summary.terminated,
        "Tool Data Sink stopped"
    );
    Ok(())
}
