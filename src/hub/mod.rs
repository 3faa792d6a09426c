//! Seams between the device loops and the external message hub.
//!
//! The loops only see these traits; the MQTT/HTTP transports and the in-memory
//! hub implement them.

use crate::config::ConnectionDescriptor;
use crate::error::HubResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;
pub mod registry;

pub use memory::{MemoryHub, MemoryHubOptions};
pub use registry::HttpRegistry;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCredential {
    pub device_id: String,
    pub primary_key: String,
}

/// Device-to-cloud message.
#[derive(Debug, Clone, PartialEq)]
pub struct HubMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HubMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            body,
            content_type: None,
            content_encoding: None,
            created_at: Utc::now(),
        }
    }

    pub fn json(body: Vec<u8>) -> Self {
        Self::new(body)
            .with_content_type(CONTENT_TYPE_JSON)
            .with_content_encoding(CONTENT_ENCODING_UTF8)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Cloud-to-device message awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Handle the endpoint uses to complete this delivery.
    pub lock_token: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(lock_token: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            lock_token: lock_token.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn decode(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub partition_id: String,
    pub payload: Option<Vec<u8>>,
}

impl StreamEvent {
    pub fn new(partition_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            partition_id: partition_id.into(),
            payload: Some(payload),
        }
    }

    pub fn empty(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            payload: None,
        }
    }

    /// Decoded body, or `None` when the event carries no data.
    pub fn text(&self) -> Option<String> {
        self.payload
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }
}

/// Device identity registry of the hub control plane.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Creates the device; fails with `HubError::AlreadyExists` when the name is taken.
    async fn add_device(&self, name: &str) -> HubResult<DeviceCredential>;

    async fn get_device(&self, name: &str) -> HubResult<DeviceCredential>;
}

/// Device-level pub/sub endpoint.
#[async_trait]
pub trait DeviceEndpoint: Send + Sync {
    async fn send(&self, message: HubMessage) -> HubResult<()>;

    /// Returns immediately with `None` when nothing is pending.
    async fn receive_one(&self) -> HubResult<Option<InboundMessage>>;

    async fn acknowledge(&self, message: &InboundMessage) -> HubResult<()>;
}

/// Hub-wide partitioned event log.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open_consumer(
        &self,
        consumer_group: &str,
        descriptor: &ConnectionDescriptor,
    ) -> HubResult<Box<dyn EventConsumer>>;
}

/// A consumer reading all partitions for one consumer group.
#[async_trait]
pub trait EventConsumer: Send {
    /// Next event from any partition; `Ok(None)` once the stream has ended.
    async fn next_event(&mut self) -> HubResult<Option<StreamEvent>>;

    async fn close(&mut self) -> HubResult<()>;
}

#[async_trait]
impl<T: DeviceRegistry + ?Sized> DeviceRegistry for std::sync::Arc<T> {
    async fn add_device(&self, name: &str) -> HubResult<DeviceCredential> {
        (**self).add_device(name).await
    }

    async fn get_device(&self, name: &str) -> HubResult<DeviceCredential> {
        (**self).get_device(name).await
    }
}

#[async_trait]
impl<T: DeviceEndpoint + ?Sized> DeviceEndpoint for std::sync::Arc<T> {
    async fn send(&self, message: HubMessage) -> HubResult<()> {
        (**self).send(message).await
    }

    async fn receive_one(&self) -> HubResult<Option<InboundMessage>> {
        (**self).receive_one().await
    }

    async fn acknowledge(&self, message: &InboundMessage) -> HubResult<()> {
        (**self).acknowledge(message).await
    }
}

#[async_trait]
impl<T: EventSource + ?Sized> EventSource for std::sync::Arc<T> {
    async fn open_consumer(
        &self,
        consumer_group: &str,
        descriptor: &ConnectionDescriptor,
    ) -> HubResult<Box<dyn EventConsumer>> {
        (**self).open_consumer(consumer_group, descriptor).await
    }
}
