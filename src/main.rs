//! editor-bridge
//!
//! `serve` runs the MCP server that talks to a host application over the
//! bridge. `forwarder` runs a standalone host loop that executes requests
//! through an interpreter process, for hosts without an embedded forwarder.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use editor_bridge::backend::InterpreterExecutor;
use editor_bridge::config::Config;
use editor_bridge::host::HostContext;
use editor_bridge::mcp;
use editor_bridge::supervisor::BridgeService;

#[derive(Parser, Debug)]
#[command(name = "editor-bridge", version)]
#[command(about = "Bridge between a tick-driven host application and MCP clients")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// JSON config file, applied before `.env` and environment variables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Target {
    /// Forwarder host (overrides EDITOR_HOST)
    #[arg(long)]
    forwarder_host: Option<String>,

    /// Forwarder port (overrides EDITOR_PORT)
    #[arg(long)]
    forwarder_port: Option<u16>,
}

impl Target {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.forwarder_host {
            config.forwarder_host = host;
        }
        if let Some(port) = self.forwarder_port {
            config.forwarder_port = port;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MCP server on stdio, connected to the host's forwarder
    Serve {
        #[command(flatten)]
        target: Target,
    },

    /// Run a standalone forwarder that executes code with an interpreter
    Forwarder {
        #[command(flatten)]
        target: Target,

        /// Milliseconds between host ticks
        #[arg(long, default_value_t = 16)]
        tick_ms: u64,

        /// Interpreter command line; code is passed on stdin
        #[arg(long, default_value = "python3 -")]
        interpreter: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Serve { target } => {
            target.apply(&mut config);
            info!(addr = %config.addr(), "Loaded configuration");
            serve(&config).await
        }
        Command::Forwarder {
            target,
            tick_ms,
            interpreter,
        } => {
            target.apply(&mut config);
            let executor = InterpreterExecutor::from_command_line(&interpreter)
                .context("--interpreter must name a program")?
                .with_timeout(Duration::from_millis(config.execution_timeout_ms));
            info!(addr = %config.addr(), interpreter = %executor.program(), "Loaded configuration");
            run_forwarder(config, executor, Duration::from_millis(tick_ms.max(1))).await
        }
    }
}

async fn serve(config: &Config) -> Result<()> {
    let service = BridgeService::from_config(config);
    service.start().await;

    let served = mcp::serve_stdio(Arc::clone(service.connection())).await;

    service.stop().await;
    served
}

async fn run_forwarder(config: Config, executor: InterpreterExecutor, tick: Duration) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));

    tokio::spawn({
        let stop = Arc::clone(&stop);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; stopping forwarder");
                stop.store(true, Ordering::Release);
            }
        }
    });

    // The host context is single-threaded; give it a thread of its own
    tokio::task::spawn_blocking(move || host_loop(&config, executor, tick, &stop))
        .await
        .context("Host loop panicked")?
}

fn host_loop(config: &Config, executor: InterpreterExecutor, tick: Duration, stop: &AtomicBool) -> Result<()> {
    let ctx = HostContext::new(config.forwarder_host.clone(), config.forwarder_port, executor);
    ctx.start().context("Failed to start forwarder")?;
    if let Some(addr) = ctx.local_addr() {
        info!(%addr, "Forwarder listening");
    }

    let mut last = Instant::now();
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        ctx.tick(now.duration_since(last).as_secs_f32());
        last = now;
        std::thread::sleep(tick);
    }

    ctx.stop();
    Ok(())
}
