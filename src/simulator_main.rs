use anyhow::{Context, Result};
use clap::Parser;
use hub_device_sim::config::SimulatorConfig;
use hub_device_sim::device::{HubConnections, RunOptions, Simulator};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(windows)]
use tokio::signal;

#[derive(Parser)]
#[command(name = "device-simulator")]
#[command(about = "Simulated IoT device - telemetry, cloud-to-device commands and event stream")]
#[command(version)]
struct Args {
    #[arg(short, long, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(long, help = "Generate default configuration file")]
    generate_config: bool,

    #[arg(long, help = "Do not consume the hub event stream")]
    no_stream: bool,

    #[arg(long, help = "Wait for one cloud-to-device command alongside the loops")]
    receive_command: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_filter = if args.verbose {
        "debug,rumqttc=info"
    } else {
        "info,rumqttc=warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_target(false)
        .init();

    info!("Starting device simulator v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.unwrap_or_else(SimulatorConfig::get_config_path);

    if args.generate_config {
        let default_config = SimulatorConfig::default();
        default_config
            .save_to_file(&config_path)
            .context("Failed to generate default configuration")?;
        info!("Default configuration saved to: {:?}", config_path);
        return Ok(());
    }

    let mut config =
        SimulatorConfig::load_from_file(&config_path).context("Failed to load configuration")?;
    config.apply_env_overrides();
    config.validate().context("Invalid configuration")?;

    info!("Configuration loaded from: {:?}", config_path);
    info!("Device: {}", config.device.name);
    info!("Transport: {:?}", config.hub.transport);

    let needs = config.simulator_needs(!args.no_stream);
    let connections =
        HubConnections::connect(&config, needs).context("Failed to set up hub connections")?;

    let cancel = CancellationToken::new();
    let simulator = Simulator::new(config, connections);
    let options = RunOptions {
        stream_events: !args.no_stream,
        receive_command: args.receive_command,
    };

    let run_token = cancel.clone();
    let mut simulator_handle = tokio::spawn(async move { simulator.run(run_token, options).await });

    let outcome = tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("Received shutdown signal");
            cancel.cancel();
            (&mut simulator_handle).await
        }
        result = &mut simulator_handle => result,
    };

    match outcome {
        Ok(Ok(report)) => {
            for (name, err) in report.failures() {
                warn!("The {} stopped early: {}", name, err);
            }
            if let Some(stats) = report.publish {
                info!("Telemetry: {} sent, {} failed", stats.sent, stats.failures);
            }
            if let Some(stats) = report.stream {
                info!(
                    "Event stream: {} events, {} reconnects",
                    stats.events, stats.reconnects
                );
            }
            if let Some(command) = report.command {
                info!("Command received: {}", command);
            }
        }
        Ok(Err(e)) => {
            error!("Simulator error: {:#}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Simulator task error: {}", e);
            std::process::exit(1);
        }
    }

    info!("Shutting down device simulator");
    Ok(())
}

/// Cross-platform shutdown signal handling
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

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
