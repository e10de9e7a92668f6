//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the gateway daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use r_gw_common::config::AppConfig;
use r_gw_common::logging::init_tracing;
use r_gw_common::DeviceAddress;
use r_gw_core::{discover_devices, load_devices, GatewayOrchestrator, RunMode};
use r_gw_net::ProbeRegistry;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("R-EMS gateway ", env!("CARGO_PKG_VERSION")),
    about = "Modbus TCP field gateway daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Discover devices, then poll and forward until terminated")]
    Run(DeviceArgs),
    #[command(about = "Scan the configured subnet and write the device list")]
    Scan,
    #[command(about = "Poll devices into the reading log without forwarding")]
    Poll(DeviceArgs),
    #[command(about = "Forward logged readings to the platform without polling")]
    Forward,
    #[command(about = "Validate the configuration and exit")]
    CheckConfig,
}

#[derive(Debug, Default, Args)]
struct DeviceArgs {
    #[arg(
        long,
        value_name = "FILE",
        help = "Use a saved device list instead of scanning the subnet"
    )]
    devices: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/gateway.toml"));
    candidates.push(PathBuf::from("configs/gateway.example.toml"));

    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let config = loaded_config.config;
    let config_path = loaded_config.source;

    let command = cli
        .command
        .unwrap_or_else(|| Commands::Run(DeviceArgs::default()));
    if let Commands::CheckConfig = command {
        println!("Configuration OK: {}", config_path.display());
        return Ok(());
    }

    init_tracing("r-gwd", &config.logging)?;
    info!(config_path = %config_path.display(), "configuration loaded");

    match command {
        Commands::Run(args) => run_gateway(config, args.devices, RunMode::Full).await?,
        Commands::Poll(args) => run_gateway(config, args.devices, RunMode::PollOnly).await?,
        Commands::Forward => run_gateway(config, None, RunMode::ForwardOnly).await?,
        Commands::Scan => {
            let registry = ProbeRegistry::with_builtin(config.poller.unit_id);
            let devices = discover_devices(&config, &registry).await?;
            for device in &devices {
                println!("{}\t{}", device.address(), device.protocol);
            }
            println!(
                "{} device(s) written to {}",
                devices.len(),
                config.discovery.devices_file.display()
            );
        }
        Commands::CheckConfig => {}
    }

    Ok(())
}

async fn run_gateway(config: AppConfig, devices_file: Option<PathBuf>, mode: RunMode) -> Result<()> {
    let devices = if mode.polls() {
        resolve_devices(&config, devices_file).await?
    } else {
        Vec::new()
    };

    let orchestrator = GatewayOrchestrator::new(config)?;
    let mut handle = orchestrator.start(devices, mode).await?;

    info!(mode = ?mode, "gateway running; waiting for termination signal");
    tokio::select! {
        _ = shutdown_signal() => info!("termination signal received; shutting down"),
        _ = handle.stopped() => warn!("gateway component stopped; shutting down"),
    }
    handle.shutdown().await
}

async fn resolve_devices(
    config: &AppConfig,
    devices_file: Option<PathBuf>,
) -> Result<Vec<DeviceAddress>> {
    let registry = ProbeRegistry::with_builtin(config.poller.unit_id);
    match devices_file {
        Some(path) => {
            let devices = load_devices(&path, &registry)?;
            info!(devices = devices.len(), path = %path.display(), "device list loaded");
            Ok(devices)
        }
        None => Ok(discover_devices(config, &registry)
            .await?
            .iter()
            .map(|device| device.address())
            .collect()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
