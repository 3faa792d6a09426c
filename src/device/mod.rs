use crate::config::{ConnectionDescriptor, ConnectionNeeds, SimulatorConfig, TransportKind};
use crate::error::HubError;
use crate::hub::{DeviceCredential, DeviceEndpoint, DeviceRegistry, EventSource, HttpRegistry, MemoryHub};
use crate::mqtt::{LazyDeviceEndpoint, MqttEventSource};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod provisioner;
pub mod publisher;
pub mod receiver;
pub mod retry;
pub mod stream;

pub use provisioner::IdentityProvisioner;
pub use publisher::{PublishStats, TelemetryPublisher, TelemetryReading, TemperatureSensor};
pub use receiver::CommandReceiver;
pub use retry::RetryPolicy;
pub use stream::{ConsumeStats, EventStreamReceiver};

const MEMORY_HUB_DESCRIPTOR: &str = "HostName=localhost.memory";

/// Transport handles the simulator runs against. Each part is optional so an
/// operation opens only what it uses.
///
/// The publisher and the command receiver share one device endpoint: the hub
/// admits a single session per device identity.
#[derive(Clone, Default)]
pub struct HubConnections {
    registry: Option<Arc<dyn DeviceRegistry>>,
    device: Option<Arc<dyn DeviceEndpoint>>,
    events: Option<(Arc<dyn EventSource>, ConnectionDescriptor)>,
}

impl HubConnections {
    /// Builds the parts named by `needs`. Nothing touches the network here:
    /// the device session opens on first use and the event stream per attempt.
    pub fn connect(config: &SimulatorConfig, needs: ConnectionNeeds) -> Result<Self> {
        config
            .validate_connections(needs)
            .context("Invalid connection settings")?;

        match config.hub.transport {
            TransportKind::Memory => {
                let hub = MemoryHub::new(config.stream.partition_count);
                Ok(Self::memory(&hub, &config.device.name))
            }
            TransportKind::Mqtt => {
                let timeout = config.hub.request_timeout();
                let mut connections = Self::default();

                if needs.hub() {
                    let hub_descriptor = config.hub_descriptor()?;
                    if needs.registry {
                        let registry = HttpRegistry::new(
                            &hub_descriptor,
                            config.hub.registry_api_version.clone(),
                            timeout,
                        )
                        .context("Failed to create registry client")?;
                        connections = connections.with_registry(Arc::new(registry));
                    }
                    if needs.events {
                        let source =
                            MqttEventSource::new(format!("{}-events", config.device.name), timeout);
                        connections = connections.with_events(Arc::new(source), hub_descriptor);
                    }
                }

                if needs.device {
                    let device_descriptor = config.device_descriptor()?;
                    info!("Device endpoint configured ({})", device_descriptor.redacted());
                    let device = LazyDeviceEndpoint::new(device_descriptor, timeout)
                        .context("Invalid device connection string")?;
                    connections = connections.with_device(Arc::new(device));
                }

                Ok(connections)
            }
        }
    }

    pub fn memory(hub: &MemoryHub, device_id: &str) -> Self {
        Self::default()
            .with_registry(Arc::new(hub.clone()))
            .with_device(Arc::new(hub.device_endpoint(device_id)))
            .with_events(
                Arc::new(hub.clone()),
                ConnectionDescriptor::parse(MEMORY_HUB_DESCRIPTOR).unwrap_or_default(),
            )
    }

    pub fn with_registry(mut self, registry: Arc<dyn DeviceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_device(mut self, device: Arc<dyn DeviceEndpoint>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_events(mut self, source: Arc<dyn EventSource>, hub_descriptor: ConnectionDescriptor) -> Self {
        self.events = Some((source, hub_descriptor));
        self
    }

    pub fn registry(&self) -> Result<Arc<dyn DeviceRegistry>> {
        self.registry
            .clone()
            .context("Device registry is not connected")
    }

    pub fn device(&self) -> Result<Arc<dyn DeviceEndpoint>> {
        self.device
            .clone()
            .context("Device endpoint is not connected")
    }

    /// Event source together with the hub descriptor the stream is derived from.
    pub fn events(&self) -> Result<(Arc<dyn EventSource>, ConnectionDescriptor)> {
        self.events
            .clone()
            .context("Event stream is not connected")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub stream_events: bool,
    pub receive_command: bool,
}

/// Outcome of one simulator run. A loop that stopped with an error leaves its
/// stats empty and its error set; the other loops are unaffected.
#[derive(Debug, Default)]
pub struct SimulatorReport {
    pub credential: Option<DeviceCredential>,
    pub publish: Option<PublishStats>,
    pub publish_error: Option<HubError>,
    pub stream: Option<ConsumeStats>,
    pub stream_error: Option<HubError>,
    pub command: Option<String>,
    pub command_error: Option<HubError>,
}

impl SimulatorReport {
    /// Loops that stopped with an error, by name.
    pub fn failures(&self) -> Vec<(&'static str, &HubError)> {
        [
            ("telemetry publisher", self.publish_error.as_ref()),
            ("event stream receiver", self.stream_error.as_ref()),
            ("command receiver", self.command_error.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, err)| err.map(|err| (name, err)))
        .collect()
    }
}

/// Runs the device loops side by side under one cancellation token.
pub struct Simulator {
    config: Arc<SimulatorConfig>,
    connections: HubConnections,
}

impl Simulator {
    pub fn new(config: SimulatorConfig, connections: HubConnections) -> Self {
        Self {
            config: Arc::new(config),
            connections,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub async fn provision(&self) -> Result<DeviceCredential> {
        let provisioner = IdentityProvisioner::new(self.connections.registry()?);
        provisioner
            .ensure_device(&self.config.device.name)
            .await
            .with_context(|| format!("Failed to provision device {}", self.config.device.name))
    }

    pub fn publisher(&self) -> Result<TelemetryPublisher<Arc<dyn DeviceEndpoint>>> {
        let sensor = TemperatureSensor::from_config(&self.config.telemetry)
            .context("Invalid telemetry settings")?;
        Ok(TelemetryPublisher::new(
            self.connections.device()?,
            sensor,
            self.config.telemetry.interval(),
            self.config.retry.publish.clone(),
        ))
    }

    pub fn command_receiver(&self) -> Result<CommandReceiver<Arc<dyn DeviceEndpoint>>> {
        Ok(CommandReceiver::new(
            self.connections.device()?,
            self.config.receiver.poll_interval(),
        ))
    }

    pub fn stream_receiver(&self) -> Result<EventStreamReceiver<Arc<dyn EventSource>>> {
        let (source, hub_descriptor) = self.connections.events()?;
        Ok(EventStreamReceiver::new(
            source,
            hub_descriptor,
            self.config.stream.consumer_group.clone(),
            self.config.retry.stream.clone(),
        ))
    }

    /// Provisions when configured, then runs the loops until `cancel` fires.
    ///
    /// Each loop gets a child of `cancel` and ends on its own; a loop that fails
    /// is recorded in the report while the others keep running. `Err` means the
    /// simulator could not start.
    pub async fn run(self, cancel: CancellationToken, options: RunOptions) -> Result<SimulatorReport> {
        info!("Starting device simulator for {}", self.config.device.name);
        let mut report = SimulatorReport::default();

        if self.config.device.provision_on_start {
            let credential = self.provision().await?;
            info!("Device {} is provisioned", credential.device_id);
            report.credential = Some(credential);
        }

        let stream_enabled = options.stream_events && self.config.stream.enabled;
        let mut publisher = self.publisher()?;
        let stream_receiver = if stream_enabled {
            Some(self.stream_receiver()?)
        } else {
            None
        };
        let command_receiver = if options.receive_command {
            Some(self.command_receiver()?)
        } else {
            None
        };

        let publish_token = cancel.child_token();
        let publish_handle = tokio::spawn(async move { publisher.run(publish_token).await });

        let stream_handle = stream_receiver.map(|mut receiver| {
            let stream_token = cancel.child_token();
            tokio::spawn(async move { receiver.run(stream_token).await })
        });

        let command_handle = command_receiver.map(|receiver| {
            let command_token = cancel.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = command_token.cancelled() => None,
                    received = receiver.receive_one() => Some(received),
                }
            })
        });

        match publish_handle.await.context("Telemetry publisher task panicked")? {
            Ok(stats) => report.publish = Some(stats),
            Err(e) => {
                error!("Telemetry publisher stopped: {}", e);
                report.publish_error = Some(e);
            }
        }

        if let Some(handle) = stream_handle {
            match handle.await.context("Event stream task panicked")? {
                Ok(stats) => report.stream = Some(stats),
                Err(e) => {
                    error!("Event stream receiver stopped: {}", e);
                    report.stream_error = Some(e);
                }
            }
        }

        if let Some(handle) = command_handle {
            match handle.await.context("Command receiver task panicked")? {
                Some(Ok(command)) => report.command = Some(command),
                Some(Err(e)) => {
                    warn!("Command receiver failed: {}", e);
                    report.command_error = Some(e);
                }
                None => info!("Command receiver stopped before a command arrived"),
            }
        }

        info!("Device simulator stopped");
        Ok(report)
    }
}
