use super::topics::{parse_cloud_to_device_topic, TopicBuilder};
use super::{build_options, classify_connection_error, MQTT_API_VERSION};
use crate::config::ConnectionDescriptor;
use crate::error::{HubError, HubResult};
use crate::hub::{DeviceEndpoint, HubMessage, InboundMessage};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, Publish, QoS};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Device-level endpoint over the hub's MQTT surface.
///
/// The event loop runs in a background task for the lifetime of the endpoint;
/// cloud-to-device publishes are buffered until `receive_one` picks them up and
/// are only acknowledged to the broker through `acknowledge`.
pub struct MqttDeviceEndpoint {
    client: AsyncClient,
    topic_builder: TopicBuilder,
    inbox: Mutex<mpsc::UnboundedReceiver<Publish>>,
    in_flight: Mutex<HashMap<String, Publish>>,
    connected: watch::Receiver<bool>,
    driver: JoinHandle<()>,
}

impl MqttDeviceEndpoint {
    /// Connects with the device descriptor and waits up to `timeout` for the
    /// broker to accept the session.
    pub async fn connect(descriptor: &ConnectionDescriptor, timeout: Duration) -> HubResult<Self> {
        let endpoint = Self::spawn(descriptor)?;

        let mut connected = endpoint.connected.clone();
        tokio::time::timeout(timeout, connected.wait_for(|up| *up))
            .await?
            .map_err(|_| HubError::transient("MQTT event loop stopped before connecting"))?;

        Ok(endpoint)
    }

    /// Starts the background event loop without waiting for the broker.
    pub fn spawn(descriptor: &ConnectionDescriptor) -> HubResult<Self> {
        let host = descriptor.require_host()?;
        let device_id = descriptor.require_device_id()?.to_string();
        let username = format!(
            "{}/{}/?api-version={}",
            host, device_id, MQTT_API_VERSION
        );

        let mut mqtt_options = build_options(&device_id, descriptor, Some(username), false)?;
        mqtt_options.set_manual_acks(true);

        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);
        let topic_builder = TopicBuilder::new(device_id);
        let (inbox_sender, inbox) = mpsc::unbounded_channel();
        let (state_sender, connected) = watch::channel(false);

        let driver = tokio::spawn(run_device_event_loop(
            event_loop,
            client.clone(),
            topic_builder.clone(),
            inbox_sender,
            state_sender,
        ));

        Ok(Self {
            client,
            topic_builder,
            inbox: Mutex::new(inbox),
            in_flight: Mutex::new(HashMap::new()),
            connected,
            driver,
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

impl Drop for MqttDeviceEndpoint {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl DeviceEndpoint for MqttDeviceEndpoint {
    async fn send(&self, message: HubMessage) -> HubResult<()> {
        if !self.is_connected() {
            return Err(HubError::transient("not connected to the hub"));
        }

        let topic = self.topic_builder.telemetry(&message);
        debug!("Publishing telemetry to topic: {}", topic);

        // try_publish fails fast when the request queue is saturated instead of
        // parking the publisher behind a dead connection.
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, message.body)
            .map_err(|e| HubError::transient(format!("failed to queue publish: {}", e)))
    }

    async fn receive_one(&self) -> HubResult<Option<InboundMessage>> {
        let publish = match self.inbox.lock().await.try_recv() {
            Ok(publish) => publish,
            Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return Err(HubError::transient("MQTT event loop has stopped"))
            }
        };

        let lock_token = format!("{}-{}", publish.pkid, uuid::Uuid::new_v4().simple());
        let message = InboundMessage::new(lock_token.clone(), publish.payload.to_vec());
        self.in_flight.lock().await.insert(lock_token, publish);

        Ok(Some(message))
    }

    async fn acknowledge(&self, message: &InboundMessage) -> HubResult<()> {
        let publish = self
            .in_flight
            .lock()
            .await
            .remove(&message.lock_token)
            .ok_or_else(|| {
                HubError::fatal(format!(
                    "unknown or already completed lock token {}",
                    message.lock_token
                ))
            })?;

        self.client
            .ack(&publish)
            .await
            .map_err(|e| HubError::transient(format!("failed to acknowledge message: {}", e)))
    }
}

/// Device endpoint that opens its MQTT session on first use.
///
/// A device being provisioned has no identity on the broker yet, so the session
/// waits until the first send or poll. A failed open is retried on the next call.
pub struct LazyDeviceEndpoint {
    descriptor: ConnectionDescriptor,
    timeout: Duration,
    session: OnceCell<MqttDeviceEndpoint>,
}

impl LazyDeviceEndpoint {
    pub fn new(descriptor: ConnectionDescriptor, timeout: Duration) -> HubResult<Self> {
        descriptor.require_host()?;
        descriptor.require_device_id()?;
        Ok(Self {
            descriptor,
            timeout,
            session: OnceCell::new(),
        })
    }

    async fn session(&self) -> HubResult<&MqttDeviceEndpoint> {
        self.session
            .get_or_try_init(|| async {
                info!("Opening device session ({})", self.descriptor.redacted());
                MqttDeviceEndpoint::connect(&self.descriptor, self.timeout).await
            })
            .await
    }
}

#[async_trait]
impl DeviceEndpoint for LazyDeviceEndpoint {
    async fn send(&self, message: HubMessage) -> HubResult<()> {
        self.session().await?.send(message).await
    }

    async fn receive_one(&self) -> HubResult<Option<InboundMessage>> {
        self.session().await?.receive_one().await
    }

    async fn acknowledge(&self, message: &InboundMessage) -> HubResult<()> {
        self.session().await?.acknowledge(message).await
    }
}

async fn run_device_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    topic_builder: TopicBuilder,
    inbox: mpsc::UnboundedSender<Publish>,
    connected: watch::Sender<bool>,
) {
    info!("Starting MQTT device event loop for {}", topic_builder.device_id());

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to hub as {}", topic_builder.device_id());
                connected.send_replace(true);

                let filter = topic_builder.cloud_to_device();
                if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                    error!("Failed to subscribe to {}: {}", filter, e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if parse_cloud_to_device_topic(&publish.topic, topic_builder.device_id()).is_some()
                {
                    debug!("Received cloud-to-device message on {}", publish.topic);
                    if inbox.send(publish).is_err() {
                        warn!("Device endpoint dropped, stopping event loop");
                        return;
                    }
                } else {
                    warn!("Received message on unexpected topic: {}", publish.topic);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscribed to cloud-to-device messages");
            }
            Ok(_) => {}
            Err(e) => {
                connected.send_replace(false);
                let err = classify_connection_error(&e);
                if matches!(err, HubError::Cancelled) {
                    info!("MQTT client closed, stopping event loop");
                    return;
                }
                error!("MQTT connection error ({}): {}", err.kind(), e);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}
