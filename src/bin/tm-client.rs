//! Tool Meister client - drive every participant through one action
//!
//! Publishes one command to all Tool Meisters and the Tool Data Sink listed
//! in the roster, waits for each of their statuses, and exits with a code
//! that tells the cause of any failure.
//!
//! # Usage
//!
//! ```bash
//! # Start the tools of group "default" collecting into a directory
//! tm-client dispatch start default /var/lib/pbench-agent/run/tools-default/1
//!
//! # End, collect sysinfo, then terminate every participant
//! tm-client stop --sysinfo default
//!
//! # Point at another broker
//! PBENCH_REDIS_SERVER=ctl.example.com:17001 tm-client dispatch init default
//!
//! # Enable debug logging
//! _PBENCH_TOOL_MEISTER_CLIENT_LOG_LEVEL=debug tm-client dispatch init default
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | every participant reported success |
//! | 1 | cycle failure (mismatch, failed status, missing status, lost connection) |
//! | 2 | cannot connect to the broker |
//! | 3 | roster key never appeared |
//! | 4 | roster is not a roster document |
//! | 5 | roster has no data sink |
//! | 6 | roster has no Tool Meisters |
//! | 7 | unrecognized or disallowed action |

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tm_client::{
    exit_code, run_stop, Coordinator, CoordinatorConfig, CoordinatorError, PidFileShutdown,
    StopRequest, SystemProcesses,
};
use tm_core::{Action, BrokerAddress, TmConfig};
use tm_protocol::RedisBroker;

const CLIENT_LOG_ENV: &str = "_PBENCH_TOOL_MEISTER_CLIENT_LOG_LEVEL";
const STOP_LOG_ENV: &str = "_PBENCH_TOOL_MEISTER_STOP_LOG_LEVEL";

/// Tool Meister client - coordinate benchmark tools across hosts
#[derive(Parser, Debug)]
#[command(name = "tm-client", version, about)]
struct Args {
    /// Broker location, `<host>[:<port>]` (overrides PBENCH_REDIS_SERVER)
    #[arg(long, global = true)]
    broker: Option<String>,

    /// Channel name prefix
    #[arg(long, global = true)]
    channel_prefix: Option<String>,

    /// Key holding the participant roster
    #[arg(long, global = true)]
    roster_key: Option<String>,

    /// Seconds to wait for the roster key to appear
    #[arg(long, global = true)]
    roster_timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one action and collect every participant's status
    Dispatch {
        /// init, start, stop, send, end, sysinfo or kill
        action: String,
        /// Tool group the action applies to
        group: Option<String>,
        /// Directory the tools store their data in
        directory: Option<String>,
    },
    /// End the tools, optionally collect sysinfo, then terminate everything
    Stop {
        /// Tool group being stopped
        group: String,
        /// Benchmark run directory (overrides benchmark_run_dir)
        #[arg(long)]
        run_dir: Option<PathBuf>,
        /// Collect system information after ending the tools
        #[arg(long)]
        sysinfo: bool,
        /// Stop in response to an interrupt
        #[arg(long)]
        interrupt: bool,
    },
}

fn main() {
    let args = Args::parse();
    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tm-client: {e:#}");
            exit_code::CYCLE_FAILED
        }
    };
    process::exit(code);
}

/// Applies command-line overrides on top of file and environment settings.
fn load_config(args: &Args) -> Result<TmConfig> {
    let mut config = TmConfig::load().context("Failed to load configuration")?;
    if let Some(spec) = &args.broker {
        config.broker = BrokerAddress::parse(spec).context("Invalid --broker")?;
    }
    if let Some(prefix) = &args.channel_prefix {
        config.channel_prefix = prefix.clone();
    }
    if let Some(key) = &args.roster_key {
        config.roster_key = key.clone();
    }
    if let Some(secs) = args.roster_timeout {
        config.roster_timeout_secs = secs;
    }
    Ok(config)
}

fn init_logging(level_env: &str) -> Result<()> {
    let level = match env::var(level_env) {
        Ok(level) if level == "debug" => "debug",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("tm_client={level}").parse()?)
                .add_directive(format!("tm_protocol={level}").parse()?)
                .add_directive(format!("tm_core={level}").parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn run(args: Args) -> Result<i32> {
    let level_env = match args.command {
        Command::Dispatch { .. } => CLIENT_LOG_ENV,
        Command::Stop { .. } => STOP_LOG_ENV,
    };
    init_logging(level_env)?;

    let mut config = load_config(&args)?;

    let cancel_token = CancellationToken::new();
    let interrupt_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted");
            interrupt_token.cancel();
        }
    });

    let broker = Arc::new(RedisBroker::new(config.broker.clone()));

    match args.command {
        Command::Dispatch {
            action,
            group,
            directory,
        } => {
            let action: Action = match action.parse() {
                Ok(action) => action,
                Err(e) => {
                    let err = CoordinatorError::from(e);
                    error!("{err}");
                    return Ok(err.exit_code());
                }
            };
            let coordinator = Coordinator::new(broker, CoordinatorConfig::from_tm_config(&config))
                .with_cancel_token(cancel_token);

            match coordinator
                .dispatch(action, group.as_deref(), directory.as_deref())
                .await
            {
                Ok(report) => {
                    for failure in &report.failures {
                        error!(%action, "{failure}");
                    }
                    info!(
                        %action,
                        done = report.done_count,
                        expected = report.expected,
                        "Dispatch complete"
                    );
                    Ok(if report.is_success() {
                        exit_code::SUCCESS
                    } else {
                        exit_code::CYCLE_FAILED
                    })
                }
                Err(e) => {
                    error!(%action, "{e}");
                    Ok(e.exit_code())
                }
            }
        }
        Command::Stop {
            group,
            run_dir,
            sysinfo,
            interrupt,
        } => {
            if run_dir.is_some() {
                config.run_dir = run_dir;
            }
            let Some(run_dir) = config.run_dir.clone() else {
                error!("No benchmark run directory; set benchmark_run_dir or pass --run-dir");
                return Ok(exit_code::CYCLE_FAILED);
            };

            let mut coordinator =
                Coordinator::new(broker, CoordinatorConfig::from_tm_config(&config))
                    .with_cancel_token(cancel_token);
            if let Some(pid_file) = config.broker_pid_file() {
                coordinator = coordinator.with_transport(Box::new(PidFileShutdown::new(
                    pid_file,
                    Arc::new(SystemProcesses),
                )));
            }

            let request = StopRequest {
                group,
                run_dir,
                sysinfo,
                interrupt,
            };
            let outcome = run_stop(&coordinator, &request).await;
            if let Err(e) = &outcome.end {
                error!("end: {e}");
            }
            if let Some(Err(e)) = &outcome.sysinfo {
                warn!("sysinfo: {e}");
            }
            match &outcome.terminate {
                Ok(report) => {
                    for failure in &report.failures {
                        error!("terminate: {failure}");
                    }
                }
                Err(e) => error!("terminate: {e}"),
            }
            Ok(outcome.exit_code())
        }
    }
}
