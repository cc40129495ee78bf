// CLI Interface
//
// This module provides the command-line interface for Le Valideur.

use anyhow::{bail, Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::job::JobEnvironment;
use crate::process::SystemProcessRunner;
use crate::protocol::{ProtocolMessage, TerminalStatus};
use crate::server::ValidationServer;
use crate::session::Session;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "levalideur.toml";

/// Le Valideur - constraint validation job runner
#[derive(Parser, Debug)]
#[command(name = "levalideur")]
#[command(author = "LeIndex Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run an external constraint validation engine and stream its output over WebSocket", long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(global = true, long = "config", short = 'c', default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(global = true, long = "verbose", short = 'v')]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the WebSocket server
    Serve {
        /// Host address to bind to (overrides config)
        #[arg(long = "host")]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(long = "port")]
        port: Option<u16>,
    },

    /// Validate one constraint document locally and print the message stream
    Run {
        /// Constraint document to submit
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

impl Cli {
    /// Run the CLI
    pub async fn run(self) -> AnyhowResult<()> {
        let config = Config::load(&self.config)?.apply_env();

        init_logging(&config.server.log_level, self.verbose);

        match self.command {
            Commands::Serve { host, port } => cmd_serve(config, host, port).await,
            Commands::Run { file } => cmd_run(config, file).await,
        }
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level; `--verbose` forces debug.
fn init_logging(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Serve command implementation
async fn cmd_serve(mut config: Config, host: Option<String>, port: Option<u16>) -> AnyhowResult<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    info!("WebSocket endpoint: {}", config.server.websocket_url());
    info!("Work directory: {}", config.storage.work_dir.display());
    info!("Engine: {} {:?}", config.engine.program, config.engine.args);
    info!("Endpoints: {:?}", config.engine.endpoints);

    let server = ValidationServer::new(config)?;
    server.start().await?;

    Ok(())
}

/// Run command implementation
async fn cmd_run(config: Config, file: PathBuf) -> AnyhowResult<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config: {}", e))?;

    let document = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read constraint document: {:?}", file))?;

    let env = JobEnvironment::from_config(&config, Arc::new(SystemProcessRunner))
        .context("Failed to prepare job environment")?;

    let (tx, mut rx) = mpsc::channel::<ProtocolMessage>(config.session.outbound_buffer);
    let printer = tokio::spawn(async move {
        let stdout = std::io::stdout();
        while let Some(message) = rx.recv().await {
            let line = message.to_json()?;
            let mut out = stdout.lock();
            writeln!(out, "{}", line)?;
        }
        Ok::<(), anyhow::Error>(())
    });

    let mut session = Session::new("cli", Arc::new(env), config.session.clone(), tx);
    session.on_inbound_text(document).await;
    let report = session.wait_idle().await;
    drop(session);

    printer.await.context("Printer task failed")??;

    match report {
        Some(report) if report.status == TerminalStatus::Success => Ok(()),
        Some(report) => bail!("Validation job {} failed", report.job_id),
        None => bail!("Validation job did not complete"),
    }
}
