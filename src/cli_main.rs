use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hub_device_sim::config::{ConnectionNeeds, SimulatorConfig};
use hub_device_sim::device::{CommandReceiver, EventStreamReceiver, HubConnections, IdentityProvisioner};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "hubsim")]
#[command(about = "Device hub management CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Device identity commands
    Device {
        #[command(subcommand)]
        action: DeviceCommands,
    },
    /// Cloud-to-device message commands
    C2d {
        #[command(subcommand)]
        action: C2dCommands,
    },
    /// Hub event stream commands
    Events {
        #[command(subcommand)]
        action: EventCommands,
    },
    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum DeviceCommands {
    /// Create the device identity, or fetch it if it already exists
    Ensure {
        #[arg(help = "Device name (defaults to device.name from the configuration)")]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum C2dCommands {
    /// Wait for one cloud-to-device message and acknowledge it
    Receive,
}

#[derive(Subcommand)]
enum EventCommands {
    /// Print hub events until interrupted
    Watch {
        #[arg(long, help = "Consumer group (overrides config)")]
        group: Option<String>,
        #[arg(long, help = "Print only the payload of each event")]
        no_partition: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate default configuration
    Init,
    /// Show current configuration
    Show,
    /// Validate the configuration, including environment overrides
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_filter = if cli.verbose {
        "debug,rumqttc=info"
    } else {
        "info,rumqttc=warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config_path = cli.config.unwrap_or_else(SimulatorConfig::get_config_path);

    let result = match cli.command {
        Commands::Device { action } => handle_device_commands(action, &config_path).await,
        Commands::C2d { action } => handle_c2d_commands(action, &config_path).await,
        Commands::Events { action } => handle_event_commands(action, &config_path).await,
        Commands::Config { action } => handle_config_commands(action, &config_path),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn load_config(config_path: &PathBuf) -> Result<SimulatorConfig> {
    let mut config =
        SimulatorConfig::load_from_file(config_path).context("Failed to load configuration")?;
    config.apply_env_overrides();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn handle_device_commands(action: DeviceCommands, config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path)?;

    match action {
        DeviceCommands::Ensure { name } => {
            let name = name.unwrap_or_else(|| config.device.name.clone());
            let connections = HubConnections::connect(&config, ConnectionNeeds::REGISTRY)?;
            let provisioner = IdentityProvisioner::new(connections.registry()?);

            let credential = provisioner
                .ensure_device(&name)
                .await
                .with_context(|| format!("Failed to ensure device {}", name))?;

            println!("{}", serde_json::to_string_pretty(&credential)?);
        }
    }

    Ok(())
}

async fn handle_c2d_commands(action: C2dCommands, config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path)?;

    match action {
        C2dCommands::Receive => {
            let connections = HubConnections::connect(&config, ConnectionNeeds::DEVICE)?;
            let receiver =
                CommandReceiver::new(connections.device()?, config.receiver.poll_interval());

            info!("Waiting for a cloud-to-device message for {}", config.device.name);
            tokio::select! {
                received = receiver.receive_one() => {
                    let message = received.context("Failed to receive message")?;
                    println!("{}", message);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted before a message arrived");
                }
            }
        }
    }

    Ok(())
}

async fn handle_event_commands(action: EventCommands, config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path)?;

    match action {
        EventCommands::Watch {
            group,
            no_partition,
        } => {
            let connections = HubConnections::connect(&config, ConnectionNeeds::EVENTS)?;
            let (source, hub_descriptor) = connections.events()?;
            let group = group.unwrap_or_else(|| config.stream.consumer_group.clone());

            let (sender, mut events) = mpsc::unbounded_channel();
            let mut receiver = EventStreamReceiver::new(
                source,
                hub_descriptor,
                group,
                config.retry.stream.clone(),
            )
            .with_forwarder(sender);

            let cancel = CancellationToken::new();
            let run_token = cancel.clone();
            let mut handle = tokio::spawn(async move { receiver.run(run_token).await });

            let printer = tokio::spawn(async move {
                let mut stdout = io::stdout();
                while let Some(event) = events.recv().await {
                    let text = event.text().unwrap_or_default();
                    let line = if no_partition {
                        text
                    } else {
                        format!("[{}] {}", event.partition_id, text)
                    };
                    if writeln!(stdout, "{}", line).and_then(|_| stdout.flush()).is_err() {
                        break;
                    }
                }
            });

            let finished = tokio::select! {
                result = &mut handle => result,
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!("Failed to listen for Ctrl+C: {}", e);
                    }
                    cancel.cancel();
                    (&mut handle).await
                }
            };

            let stats = finished.context("Event stream task panicked")??;
            let _ = printer.await;
            info!(
                "Received {} events ({} reconnects)",
                stats.events, stats.reconnects
            );
        }
    }

    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config_path: &PathBuf) -> Result<()> {
    match action {
        ConfigCommands::Init => {
            let config = SimulatorConfig::default();
            config
                .save_to_file(config_path)
                .context("Failed to save configuration")?;
            info!("Configuration initialized at: {:?}", config_path);
        }
        ConfigCommands::Show => {
            let config = SimulatorConfig::load_from_file(config_path)
                .context("Failed to load configuration")?;
            let config_str =
                toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
            println!("{}", config_str);
        }
        ConfigCommands::Validate => {
            let config = load_config(config_path)?;
            config
                .validate_connections(config.simulator_needs(true))
                .context("Invalid connection settings")?;
            info!("Configuration at {:?} is valid", config_path);
        }
    }

    Ok(())
}
