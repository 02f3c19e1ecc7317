// src/main.rs

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use licmon::config::{self, ConfigOverrides, ConfigSource, LicmonConfig};
use licmon::logging;
use licmon::monitor::SystemMonitor;
use licmon::notice;
use licmon::signals;

/// Monitors NVIDIA vGPU licensing and downloads a new license token when needed.
#[derive(Debug, Parser)]
#[command(name = "licmon", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the license once and refresh the token if needed (default)
    Run(RunArgs),
    /// Check the license every interval until stopped
    Service {
        /// Config file; defaults to the service install location
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
    /// Print the GPLv3 license terms
    License,
    /// Print the warranty disclaimer
    Warranty,
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    /// Optional config file read before the flags below are applied
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Path to the nvidia-smi executable
    #[arg(long, short = 's')]
    smi_path: Option<PathBuf>,

    /// Directory holding the client configuration token
    #[arg(long, short = 'f')]
    token_dir: Option<PathBuf>,

    /// URL of the license server
    #[arg(long, short = 'u')]
    server_url: Option<String>,

    /// Skip TLS certificate verification for the token download
    #[arg(long, short = 'i')]
    ignore_ssl: bool,

    /// Log level: trace, debug, info, warn, error
    #[arg(long)]
    log_level: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            smi_path: self.smi_path.clone(),
            token_dir: self.token_dir.clone(),
            server_url: self.server_url.clone(),
            ignore_ssl: self.ignore_ssl.then_some(true),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    print!("{}", notice::COPYRIGHT_TEXT);

    match cli.command {
        None => run_once(cli.run).await,
        Some(Command::Run(args)) => run_once(args).await,
        Some(Command::Service { config }) => run_service(config).await,
        Some(Command::License) => {
            notice::print_license_terms().await;
            Ok(())
        }
        Some(Command::Warranty) => {
            println!("{}", notice::WARRANTY_TEXT);
            Ok(())
        }
    }
}

async fn run_once(args: RunArgs) -> Result<()> {
    let source = match &args.config {
        Some(path) => ConfigSource::Required(path),
        None => ConfigSource::None,
    };
    let config = LicmonConfig::load(source, &args.overrides()).context("invalid configuration")?;
    logging::init_console(&config.logging)?;

    let monitor = SystemMonitor::from_config(&config);
    monitor
        .run_once()
        .await
        .context("license check failed")?;
    Ok(())
}

async fn run_service(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(config::service_config_path);
    let config = LicmonConfig::load(ConfigSource::Required(&path), &ConfigOverrides::default())
        .with_context(|| format!("failed to load service config from {}", path.display()))?;

    let log_dir = config.logging.service_dir();
    let _log_guard = logging::init_file(&config.logging, &log_dir)?;
    info!(config = %path.display(), "Starting license monitor service");

    let shutdown = CancellationToken::new();
    let (control_tx, control_rx) = mpsc::channel(8);
    tokio::spawn(signals::forward_signals(control_tx, shutdown.clone()));

    let monitor = SystemMonitor::from_config(&config);
    let summary = monitor.run_service(control_rx, shutdown).await;
    info!(
        cycles = summary.cycles,
        refreshes = summary.refreshes,
        failures = summary.failures,
        "License monitor service exited"
    );
    Ok(())
}
