use crate::device::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub mod connection;

pub use connection::ConnectionDescriptor;

pub const HUB_CONNECTION_ENV: &str = "IOT_HUB_CONNSTR";
pub const DEVICE_CONNECTION_ENV: &str = "DEVICE_CONNSTR";
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub hub: HubConfig,
    pub device: DeviceConfig,
    pub telemetry: TelemetryConfig,
    pub receiver: ReceiverConfig,
    pub stream: StreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Mqtt,
    Memory,
}

/// Hub connections an operation opens. Only these are validated and connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionNeeds {
    pub registry: bool,
    pub device: bool,
    pub events: bool,
}

impl ConnectionNeeds {
    pub const REGISTRY: Self = Self {
        registry: true,
        device: false,
        events: false,
    };
    pub const DEVICE: Self = Self {
        registry: false,
        device: true,
        events: false,
    };
    pub const EVENTS: Self = Self {
        registry: false,
        device: false,
        events: true,
    };
    pub const ALL: Self = Self {
        registry: true,
        device: true,
        events: true,
    };

    /// The registry and the event stream both use the hub connection string.
    pub fn hub(&self) -> bool {
        self.registry || self.events
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Control-plane connection string (registry and event stream).
    pub connection_string: Option<String>,
    pub transport: TransportKind,
    pub request_timeout_seconds: u64,
    pub registry_api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// Device-level connection string (telemetry and commands).
    pub connection_string: Option<String>,
    pub provision_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub interval_seconds: u64,
    pub base_temperature: f64,
    pub jitter_min: f64,
    pub jitter_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub enabled: bool,
    pub consumer_group: String,
    pub partition_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub publish: RetryPolicy,
    pub stream: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            publish: RetryPolicy::fixed(Duration::from_secs(5)),
            stream: RetryPolicy::fixed(Duration::from_secs(1)),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig {
                connection_string: None,
                transport: TransportKind::Mqtt,
                request_timeout_seconds: 30,
                registry_api_version: "2021-04-12".to_string(),
            },
            device: DeviceConfig {
                name: "simulated-device-001".to_string(),
                connection_string: None,
                provision_on_start: false,
            },
            telemetry: TelemetryConfig {
                interval_seconds: 5,
                base_temperature: 70.0,
                jitter_min: -3.0,
                jitter_max: 3.0,
            },
            receiver: ReceiverConfig {
                poll_interval_ms: 1_000,
            },
            stream: StreamConfig {
                enabled: true,
                consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
                partition_count: 4,
            },
            retry: RetryConfig::default(),
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl ReceiverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl HubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl SimulatorConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            tracing::info!(
                "Config file not found at {:?}, creating default config",
                path
            );
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: SimulatorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    pub fn save_to_file(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Fills connection strings from `IOT_HUB_CONNSTR` and `DEVICE_CONNSTR` when set.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(HUB_CONNECTION_ENV).filter(|v| !v.trim().is_empty()) {
            self.hub.connection_string = Some(value);
        }
        if let Some(value) = lookup(DEVICE_CONNECTION_ENV).filter(|v| !v.trim().is_empty()) {
            self.device.connection_string = Some(value);
        }
    }

    pub fn hub_descriptor(&self) -> Result<ConnectionDescriptor> {
        let raw = self.hub.connection_string.as_deref().with_context(|| {
            format!(
                "Hub connection string is not configured (set hub.connection_string or {})",
                HUB_CONNECTION_ENV
            )
        })?;
        let descriptor =
            ConnectionDescriptor::parse(raw).context("Invalid hub connection string")?;
        descriptor
            .require_host()
            .context("Invalid hub connection string")?;
        Ok(descriptor)
    }

    pub fn device_descriptor(&self) -> Result<ConnectionDescriptor> {
        let raw = self.device.connection_string.as_deref().with_context(|| {
            format!(
                "Device connection string is not configured (set device.connection_string or {})",
                DEVICE_CONNECTION_ENV
            )
        })?;
        let descriptor =
            ConnectionDescriptor::parse(raw).context("Invalid device connection string")?;
        descriptor
            .require_host()
            .context("Invalid device connection string")?;
        descriptor
            .require_device_id()
            .context("Invalid device connection string")?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.name.is_empty() {
            anyhow::bail!("Device name cannot be empty");
        }

        if self.device.name.len() > 128 {
            anyhow::bail!("Device name cannot be longer than 128 characters");
        }

        if !self
            .device
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            anyhow::bail!(
                "Device name can only contain alphanumeric characters, hyphens, underscores, periods and colons"
            );
        }

        if self.telemetry.interval_seconds == 0 {
            anyhow::bail!("Telemetry interval must be greater than zero");
        }

        if !self.telemetry.base_temperature.is_finite()
            || !self.telemetry.jitter_min.is_finite()
            || !self.telemetry.jitter_max.is_finite()
        {
            anyhow::bail!("Telemetry temperature settings must be finite numbers");
        }

        if self.telemetry.jitter_min > self.telemetry.jitter_max {
            anyhow::bail!("Telemetry jitter_min cannot exceed jitter_max");
        }

        if self.receiver.poll_interval_ms == 0 {
            anyhow::bail!("Receiver poll interval must be greater than zero");
        }

        if self.hub.request_timeout_seconds == 0 {
            anyhow::bail!("Hub request timeout must be greater than zero");
        }

        if self.stream.consumer_group.is_empty() {
            anyhow::bail!("Consumer group cannot be empty");
        }

        if self.stream.partition_count == 0 {
            anyhow::bail!("Partition count must be greater than zero");
        }

        self.retry
            .publish
            .validate()
            .context("Invalid publish retry policy")?;
        self.retry
            .stream
            .validate()
            .context("Invalid stream retry policy")?;

        Ok(())
    }

    /// Checks the connection strings that `needs` depends on. The memory
    /// transport needs none.
    pub fn validate_connections(&self, needs: ConnectionNeeds) -> Result<()> {
        if self.hub.transport == TransportKind::Memory {
            return Ok(());
        }
        if needs.hub() {
            self.hub_descriptor()?;
        }
        if needs.device {
            self.device_descriptor()?;
        }
        Ok(())
    }

    /// Connections a simulator run opens with these settings.
    pub fn simulator_needs(&self, stream_events: bool) -> ConnectionNeeds {
        ConnectionNeeds {
            registry: self.device.provision_on_start,
            device: true,
            events: stream_events && self.stream.enabled,
        }
    }

    pub fn get_config_path() -> PathBuf {
        if let Ok(config_dir) = std::env::var("HUBSIM_CONFIG_DIR") {
            PathBuf::from(config_dir).join("hubsim.toml")
        } else if let Some(home) = dirs::home_dir() {
            let primary_config = home.join(".hubsim").join("config").join("hubsim.toml");
            if primary_config.exists() {
                return primary_config;
            }

            let xdg_config = home.join(".config").join("hubsim").join("hubsim.toml");
            if xdg_config.exists() {
                return xdg_config;
            }

            primary_config
        } else {
            PathBuf::from("/etc/hubsim/hubsim.toml")
        }
    }
}
