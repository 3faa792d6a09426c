use super::retry::{sleep_or_cancelled, RetryPolicy};
use crate::config::TelemetryConfig;
use crate::error::{ErrorKind, HubError, HubResult};
use crate::hub::{DeviceEndpoint, HubMessage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    #[serde(rename = "Temperature")]
    pub temperature: f64,
}

impl TelemetryReading {
    pub fn to_message(&self) -> HubResult<HubMessage> {
        let payload = serde_json::to_vec(self)?;
        Ok(HubMessage::json(payload))
    }
}

/// Synthetic thermometer: a base value plus uniform jitter.
pub struct TemperatureSensor {
    base: f64,
    jitter: RangeInclusive<f64>,
    rng: StdRng,
}

impl TemperatureSensor {
    pub fn new(base: f64, jitter_min: f64, jitter_max: f64) -> HubResult<Self> {
        if !(base.is_finite() && jitter_min.is_finite() && jitter_max.is_finite()) {
            return Err(HubError::fatal("temperature settings must be finite numbers"));
        }
        if jitter_min > jitter_max {
            return Err(HubError::fatal(format!(
                "jitter range is inverted: {} > {}",
                jitter_min, jitter_max
            )));
        }

        Ok(Self {
            base,
            jitter: jitter_min..=jitter_max,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn from_config(config: &TelemetryConfig) -> HubResult<Self> {
        Self::new(config.base_temperature, config.jitter_min, config.jitter_max)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Bounds every reading falls within.
    pub fn range(&self) -> RangeInclusive<f64> {
        (self.base + self.jitter.start())..=(self.base + self.jitter.end())
    }

    pub fn read(&mut self) -> TelemetryReading {
        TelemetryReading {
            temperature: self.base + self.rng.gen_range(self.jitter.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Running,
    RetryBackoff,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub sent: u64,
    pub failures: u64,
}

/// Device-to-cloud telemetry loop.
pub struct TelemetryPublisher<E> {
    endpoint: E,
    sensor: TemperatureSensor,
    interval: Duration,
    retry: RetryPolicy,
    state: PublisherState,
}

impl<E: DeviceEndpoint> TelemetryPublisher<E> {
    pub fn new(endpoint: E, sensor: TemperatureSensor, interval: Duration, retry: RetryPolicy) -> Self {
        Self {
            endpoint,
            sensor,
            interval,
            retry,
            state: PublisherState::Stopped,
        }
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    /// Publishes a reading every interval until `cancel` fires.
    ///
    /// Cancellation is observed at the top of each iteration and while waiting,
    /// never in the middle of a send. Failed sends are retried after the policy's
    /// delay; only a fatal error or an exhausted policy ends the loop early.
    pub async fn run(&mut self, cancel: CancellationToken) -> HubResult<PublishStats> {
        info!(
            "Starting telemetry publisher (every {:?}, readings in {:?})",
            self.interval,
            self.sensor.range()
        );

        let mut stats = PublishStats::default();
        let mut consecutive_failures = 0u32;
        self.state = PublisherState::Running;

        while !cancel.is_cancelled() {
            let reading = self.sensor.read();

            match self.publish(reading).await {
                Ok(payload) => {
                    consecutive_failures = 0;
                    stats.sent += 1;
                    self.state = PublisherState::Running;
                    info!("Sending message: {}", payload);

                    if sleep_or_cancelled(&cancel, self.interval).await {
                        break;
                    }
                }
                Err(err) => {
                    stats.failures += 1;
                    consecutive_failures += 1;

                    match err.kind() {
                        ErrorKind::Cancelled => {
                            info!("Send cancelled, stopping telemetry publisher");
                            break;
                        }
                        ErrorKind::Fatal => {
                            error!("Fatal error sending message: {}", err);
                            self.state = PublisherState::Stopped;
                            return Err(err);
                        }
                        _ => {}
                    }

                    if !self.retry.allows_retry(consecutive_failures) {
                        error!(
                            "Error sending message: {}. Giving up after {} attempts",
                            err, consecutive_failures
                        );
                        self.state = PublisherState::Stopped;
                        return Err(HubError::RetriesExhausted {
                            attempts: consecutive_failures,
                            last: Box::new(err),
                        });
                    }

                    let delay = self.retry.next_delay(consecutive_failures);
                    self.state = PublisherState::RetryBackoff;
                    warn!(
                        kind = %err.kind(),
                        "Error sending message: {}. Retrying after {:?}...",
                        err,
                        delay
                    );

                    if sleep_or_cancelled(&cancel, delay).await {
                        break;
                    }
                }
            }
        }

        self.state = PublisherState::Stopped;
        info!(
            "Telemetry publisher stopped ({} sent, {} failed)",
            stats.sent, stats.failures
        );
        Ok(stats)
    }

    async fn publish(&self, reading: TelemetryReading) -> HubResult<String> {
        let message = reading.to_message()?;
        let payload = message.body_text();
        self.endpoint.send(message).await?;
        Ok(payload)
    }
}
