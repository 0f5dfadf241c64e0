//! tabgate: tab-multiplexing gateway for a local assistant CLI.
//!
//! Accepts WebSocket connections from browser tabs, binds each tab to its own
//! assistant subprocess, and streams sequenced events back so a reloaded page
//! can resume without losing or duplicating output.

mod config;
mod router;
mod server;
mod session;
mod transport;

use anyhow::Context;
use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::GatewayServer;
use std::path::PathBuf;
use tracing::{info, warn};

/// tabgate: browser tab gateway for a local assistant
#[derive(Parser, Debug)]
#[command(name = "tabgate", version, about = "Browser tab gateway for a local assistant CLI")]
struct Cli {
    /// Bind host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.tabgate/config.toml")]
    config: String,

    /// Assistant executable
    #[arg(long)]
    program: Option<String>,

    /// Default working directory for new tabs
    #[arg(short = 'd', long)]
    working_directory: Option<String>,

    /// Seconds an idle, detached tab binding is kept
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Events retained per conversation for replay
    #[arg(long)]
    buffer_capacity: Option<usize>,

    /// Transcript directory
    #[arg(long)]
    transcript_dir: Option<String>,

    /// Disable durable transcripts
    #[arg(long)]
    no_transcript: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            host: self.host.clone(),
            port: self.port,
            program: self.program.clone(),
            working_directory: self.working_directory.clone(),
            idle_timeout: self.idle_timeout,
            buffer_capacity: self.buffer_capacity,
            transcript_dir: self.transcript_dir.clone(),
            no_transcript: self.no_transcript,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tabgate");

    let config_path = PathBuf::from(&cli.config);
    let server_config = ServerConfig::load(Some(&config_path), cli.overrides())
        .with_context(|| format!("failed to load config from {}", cli.config))?;

    let server = GatewayServer::new(server_config);
    server
        .run(shutdown_signal())
        .await
        .context("server error")?;

    info!("tabgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
