use super::topics::EventTopics;
use super::{build_options, classify_connection_error};
use crate::config::connection::ENTITY_PATH;
use crate::config::ConnectionDescriptor;
use crate::error::{HubError, HubResult};
use crate::hub::{EventConsumer, EventSource, StreamEvent};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Hub-wide event stream read through MQTT shared subscriptions, one
/// subscription group per consumer group.
#[derive(Debug, Clone)]
pub struct MqttEventSource {
    client_id_prefix: String,
    connect_timeout: Duration,
}

impl MqttEventSource {
    pub fn new(client_id_prefix: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            client_id_prefix: client_id_prefix.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl EventSource for MqttEventSource {
    async fn open_consumer(
        &self,
        consumer_group: &str,
        descriptor: &ConnectionDescriptor,
    ) -> HubResult<Box<dyn EventConsumer>> {
        let topics = EventTopics::new(descriptor.get(ENTITY_PATH));
        let client_id = format!("{}-{}", self.client_id_prefix, Uuid::new_v4().simple());
        let username = descriptor.shared_access_key_name().map(str::to_string);
        let mqtt_options = build_options(&client_id, descriptor, username, true)?;

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 10);
        let filter = topics.group_filter(consumer_group);
        client
            .subscribe(&filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| HubError::transient(format!("failed to queue subscription: {}", e)))?;

        tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut event_loop)).await??;
        info!(
            "Event stream consumer connected to {} ({})",
            descriptor.host_name().unwrap_or_default(),
            filter
        );

        Ok(Box::new(MqttEventConsumer {
            client,
            event_loop,
            topics,
            closed: false,
        }))
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> HubResult<()> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(classify_connection_error(&e)),
        }
    }
}

struct MqttEventConsumer {
    client: AsyncClient,
    event_loop: EventLoop,
    topics: EventTopics,
    closed: bool,
}

#[async_trait]
impl EventConsumer for MqttEventConsumer {
    async fn next_event(&mut self) -> HubResult<Option<StreamEvent>> {
        if self.closed {
            return Ok(None);
        }

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match self.topics.parse_partition(&publish.topic) {
                        Some(partition_id) => {
                            return Ok(Some(StreamEvent {
                                partition_id,
                                payload: Some(publish.payload.to_vec()),
                            }))
                        }
                        None => debug!("Ignoring publish on {}", publish.topic),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => return Ok(None),
                Ok(_) => {}
                Err(e) => return Err(classify_connection_error(&e)),
            }
        }
    }

    async fn close(&mut self) -> HubResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.client.try_disconnect().is_err() {
            return Ok(());
        }

        // Flush the DISCONNECT; the socket is dropped with the event loop either way.
        let event_loop = &mut self.event_loop;
        let _ = tokio::time::timeout(Duration::from_secs(1), async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        Ok(())
    }
}
