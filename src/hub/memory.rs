//! In-process hub used for offline runs and tests.
//!
//! Device-to-cloud messages land in a partitioned event log that consumer groups
//! read with a shared cursor per group, so the simulator can run end to end
//! without a broker. Events every group has read are dropped from the log, and
//! the log never holds more than `event_retention` entries.

use super::{
    DeviceCredential, DeviceEndpoint, DeviceRegistry, EventConsumer, EventSource, HubMessage,
    InboundMessage, StreamEvent,
};
use crate::config::ConnectionDescriptor;
use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_EVENT_RETENTION: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHubOptions {
    /// Upper bound on events kept for groups that have not read them yet.
    pub event_retention: usize,
    /// Keep a copy of every device-to-cloud message and completed lock token
    /// for inspection.
    pub record_traffic: bool,
}

impl Default for MemoryHubOptions {
    fn default() -> Self {
        Self {
            event_retention: DEFAULT_EVENT_RETENTION,
            record_traffic: false,
        }
    }
}

#[derive(Default)]
struct HubState {
    devices: HashMap<String, DeviceCredential>,
    inboxes: HashMap<String, VecDeque<InboundMessage>>,
    in_flight: HashMap<String, String>,
    acknowledged: Vec<String>,
    sent: Vec<(String, HubMessage)>,
    event_log: VecDeque<StreamEvent>,
    /// Absolute offset of the first entry in `event_log`.
    log_start: u64,
    group_offsets: HashMap<String, u64>,
}

impl HubState {
    fn append_event(&mut self, event: StreamEvent, retention: usize) {
        self.event_log.push_back(event);
        while self.event_log.len() > retention.max(1) {
            self.event_log.pop_front();
            self.log_start += 1;
        }
    }

    /// Drops events that every known group has already read.
    fn compact(&mut self) {
        if let Some(oldest) = self.group_offsets.values().copied().min() {
            while self.log_start < oldest && self.event_log.pop_front().is_some() {
                self.log_start += 1;
            }
        }
    }

    fn next_for_group(&mut self, group: &str) -> Option<StreamEvent> {
        let offset = self
            .group_offsets
            .get(group)
            .copied()
            .unwrap_or(0)
            .max(self.log_start);
        let event = self
            .event_log
            .get((offset - self.log_start) as usize)
            .cloned()?;
        self.group_offsets.insert(group.to_string(), offset + 1);
        self.compact();
        Some(event)
    }
}

struct Inner {
    state: Mutex<HubState>,
    events_ready: Notify,
    partition_count: u32,
    options: MemoryHubOptions,
}

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Inner>,
}

impl MemoryHub {
    pub fn new(partition_count: u32) -> Self {
        Self::with_options(partition_count, MemoryHubOptions::default())
    }

    /// A hub that records device-to-cloud traffic and acknowledgements.
    pub fn recording(partition_count: u32) -> Self {
        Self::with_options(
            partition_count,
            MemoryHubOptions {
                record_traffic: true,
                ..MemoryHubOptions::default()
            },
        )
    }

    pub fn with_options(partition_count: u32, options: MemoryHubOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HubState::default()),
                events_ready: Notify::new(),
                partition_count: partition_count.max(1),
                options,
            }),
        }
    }

    pub fn partition_for(&self, device_id: &str) -> String {
        let hash = device_id
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        (hash % self.inner.partition_count).to_string()
    }

    pub fn device_endpoint(&self, device_id: impl Into<String>) -> MemoryDeviceEndpoint {
        MemoryDeviceEndpoint {
            hub: self.clone(),
            device_id: device_id.into(),
        }
    }

    /// Queues a cloud-to-device message for `device_id`.
    pub async fn send_to_device(&self, device_id: &str, payload: impl Into<Vec<u8>>) -> String {
        let lock_token = Uuid::new_v4().to_string();
        let message = InboundMessage::new(lock_token.clone(), payload.into());
        let mut state = self.inner.state.lock().await;
        state
            .inboxes
            .entry(device_id.to_string())
            .or_default()
            .push_back(message);
        lock_token
    }

    /// Appends a raw event to the log, bypassing device routing.
    pub async fn publish_event(&self, event: StreamEvent) {
        self.inner
            .state
            .lock()
            .await
            .append_event(event, self.inner.options.event_retention);
        self.inner.events_ready.notify_waiters();
    }

    /// Messages sent by `device_id`. Empty unless the hub records traffic.
    pub async fn sent_messages(&self, device_id: &str) -> Vec<HubMessage> {
        self.inner
            .state
            .lock()
            .await
            .sent
            .iter()
            .filter(|(id, _)| id == device_id)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Completed lock tokens. Empty unless the hub records traffic.
    pub async fn acknowledged(&self) -> Vec<String> {
        self.inner.state.lock().await.acknowledged.clone()
    }

    pub async fn pending_for(&self, device_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .inboxes
            .get(device_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DeviceRegistry for MemoryHub {
    async fn add_device(&self, name: &str) -> HubResult<DeviceCredential> {
        let mut state = self.inner.state.lock().await;
        if state.devices.contains_key(name) {
            return Err(HubError::AlreadyExists(name.to_string()));
        }

        let credential = DeviceCredential {
            device_id: name.to_string(),
            primary_key: Uuid::new_v4().simple().to_string(),
        };
        state.devices.insert(name.to_string(), credential.clone());
        debug!("Registered device {}", name);
        Ok(credential)
    }

    async fn get_device(&self, name: &str) -> HubResult<DeviceCredential> {
        self.inner
            .state
            .lock()
            .await
            .devices
            .get(name)
            .cloned()
            .ok_or_else(|| HubError::fatal(format!("device '{}' not found", name)))
    }
}

#[async_trait]
impl EventSource for MemoryHub {
    async fn open_consumer(
        &self,
        consumer_group: &str,
        descriptor: &ConnectionDescriptor,
    ) -> HubResult<Box<dyn EventConsumer>> {
        debug!(
            "Opening in-memory consumer for group {} ({})",
            consumer_group,
            descriptor.redacted()
        );
        {
            let mut state = self.inner.state.lock().await;
            let start = state.log_start;
            state
                .group_offsets
                .entry(consumer_group.to_string())
                .or_insert(start);
        }

        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            group: consumer_group.to_string(),
            closed: false,
        }))
    }
}

#[derive(Clone)]
pub struct MemoryDeviceEndpoint {
    hub: MemoryHub,
    device_id: String,
}

#[async_trait]
impl DeviceEndpoint for MemoryDeviceEndpoint {
    async fn send(&self, message: HubMessage) -> HubResult<()> {
        let partition_id = self.hub.partition_for(&self.device_id);
        {
            let options = self.hub.inner.options;
            let mut state = self.hub.inner.state.lock().await;
            state.append_event(
                StreamEvent::new(partition_id, message.body.clone()),
                options.event_retention,
            );
            if options.record_traffic {
                state.sent.push((self.device_id.clone(), message));
            }
        }
        self.hub.inner.events_ready.notify_waiters();
        Ok(())
    }

    async fn receive_one(&self) -> HubResult<Option<InboundMessage>> {
        let mut state = self.hub.inner.state.lock().await;
        let next = state
            .inboxes
            .get_mut(&self.device_id)
            .and_then(VecDeque::pop_front);
        if let Some(message) = &next {
            state
                .in_flight
                .insert(message.lock_token.clone(), self.device_id.clone());
        }
        Ok(next)
    }

    async fn acknowledge(&self, message: &InboundMessage) -> HubResult<()> {
        let mut state = self.hub.inner.state.lock().await;
        match state.in_flight.remove(&message.lock_token) {
            Some(_) => {
                if self.hub.inner.options.record_traffic {
                    state.acknowledged.push(message.lock_token.clone());
                }
                Ok(())
            }
            None => Err(HubError::fatal(format!(
                "unknown or already completed lock token {}",
                message.lock_token
            ))),
        }
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    group: String,
    closed: bool,
}

#[async_trait]
impl EventConsumer for MemoryConsumer {
    async fn next_event(&mut self) -> HubResult<Option<StreamEvent>> {
        loop {
            // Register for wakeups before inspecting the log so a concurrent
            // append cannot slip between the check and the wait.
            let notified = self.inner.events_ready.notified();
            {
                if self.closed {
                    return Ok(None);
                }
                let mut state = self.inner.state.lock().await;
                if let Some(event) = state.next_for_group(&self.group) {
                    return Ok(Some(event));
                }
            }
            notified.await;
        }
    }

    async fn close(&mut self) -> HubResult<()> {
        self.closed = true;
        Ok(())
    }
}
