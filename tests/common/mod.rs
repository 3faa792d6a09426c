use async_trait::async_trait;
use hub_device_sim::config::{ConnectionDescriptor, SimulatorConfig, TransportKind};
use hub_device_sim::error::{HubError, HubResult};
use hub_device_sim::hub::{
    DeviceCredential, DeviceEndpoint, DeviceRegistry, EventConsumer, EventSource, HubMessage,
    InboundMessage, StreamEvent,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Create a test configuration that runs entirely in memory
pub fn create_test_config() -> SimulatorConfig {
    let mut config = SimulatorConfig::default();
    config.hub.transport = TransportKind::Memory;
    config.device.name = crate::test_config::TEST_DEVICE_ID.to_string();
    config
}

/// Create a test configuration pointing at a remote hub
pub fn create_remote_test_config() -> SimulatorConfig {
    let mut config = SimulatorConfig::default();
    config.hub.connection_string = Some(crate::test_config::TEST_HUB_CONNECTION.to_string());
    config.device.connection_string =
        Some(crate::test_config::TEST_DEVICE_CONNECTION.to_string());
    config.device.name = crate::test_config::TEST_DEVICE_ID.to_string();
    config
}

pub fn inbound(token: &str, payload: &str) -> InboundMessage {
    InboundMessage::new(token, payload.as_bytes().to_vec())
}

/// Device endpoint that replays scripted results and records every call.
#[derive(Default)]
pub struct ScriptedEndpoint {
    send_results: Mutex<VecDeque<HubResult<()>>>,
    default_send_error: Mutex<Option<fn() -> HubError>>,
    attempts: Mutex<Vec<(Instant, HubMessage)>>,
    inbox: Mutex<VecDeque<Option<InboundMessage>>>,
    acks: Mutex<Vec<String>>,
    receive_calls: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl ScriptedEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results handed out by successive sends; once drained sends succeed.
    pub fn with_send_results(self, results: Vec<HubResult<()>>) -> Self {
        *self.send_results.lock().unwrap() = results.into();
        self
    }

    /// Every send past the scripted results fails with the given error.
    pub fn failing_with(self, make_error: fn() -> HubError) -> Self {
        *self.default_send_error.lock().unwrap() = Some(make_error);
        self
    }

    /// Successive polls; `None` entries are empty polls. Drained script polls empty.
    pub fn with_inbox(self, polls: Vec<Option<InboundMessage>>) -> Self {
        *self.inbox.lock().unwrap() = polls.into();
        self
    }

    /// Cancels `token` once `sends` send attempts have been made.
    pub fn cancel_after_sends(self, sends: usize, token: CancellationToken) -> Self {
        *self.cancel_after.lock().unwrap() = Some((sends, token));
        self
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempted_bodies(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.body_text())
            .collect()
    }

    pub fn acks(&self) -> Vec<String> {
        self.acks.lock().unwrap().clone()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceEndpoint for ScriptedEndpoint {
    async fn send(&self, message: HubMessage) -> HubResult<()> {
        let attempts = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push((Instant::now(), message));
            attempts.len()
        };

        let result = match self.send_results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => match *self.default_send_error.lock().unwrap() {
                Some(make_error) => Err(make_error()),
                None => Ok(()),
            },
        };

        if let Some((limit, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if attempts >= *limit {
                token.cancel();
            }
        }

        result
    }

    async fn receive_one(&self) -> HubResult<Option<InboundMessage>> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.inbox.lock().unwrap().pop_front().flatten())
    }

    async fn acknowledge(&self, message: &InboundMessage) -> HubResult<()> {
        self.acks.lock().unwrap().push(message.lock_token.clone());
        Ok(())
    }
}

/// One step of a scripted event consumer.
pub enum ConsumerStep {
    Event(StreamEvent),
    Fail(HubError),
    End,
}

/// Outcome of one `open_consumer` call.
pub enum OpenStep {
    Fail(HubError),
    Consumer(Vec<ConsumerStep>),
}

/// Event source that replays scripted connection attempts.
///
/// A drained open script yields consumers that never deliver anything, and a
/// consumer with a drained step script waits forever.
#[derive(Default)]
pub struct ScriptedEventSource {
    script: Mutex<VecDeque<OpenStep>>,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    open_times: Mutex<Vec<Instant>>,
    descriptors: Mutex<Vec<ConnectionDescriptor>>,
}

impl ScriptedEventSource {
    pub fn new(script: Vec<OpenStep>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.open_times.lock().unwrap().clone()
    }

    pub fn descriptors(&self) -> Vec<ConnectionDescriptor> {
        self.descriptors.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSource for ScriptedEventSource {
    async fn open_consumer(
        &self,
        _consumer_group: &str,
        descriptor: &ConnectionDescriptor,
    ) -> HubResult<Box<dyn EventConsumer>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_times.lock().unwrap().push(Instant::now());
        self.descriptors.lock().unwrap().push(descriptor.clone());

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(OpenStep::Fail(err)) => Err(err),
            Some(OpenStep::Consumer(steps)) => Ok(Box::new(ScriptedConsumer {
                steps: steps.into(),
                closes: self.closes.clone(),
            })),
            None => Ok(Box::new(ScriptedConsumer {
                steps: VecDeque::new(),
                closes: self.closes.clone(),
            })),
        }
    }
}

struct ScriptedConsumer {
    steps: VecDeque<ConsumerStep>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl EventConsumer for ScriptedConsumer {
    async fn next_event(&mut self) -> HubResult<Option<StreamEvent>> {
        match self.steps.pop_front() {
            Some(ConsumerStep::Event(event)) => Ok(Some(event)),
            Some(ConsumerStep::Fail(err)) => Err(err),
            Some(ConsumerStep::End) => Ok(None),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> HubResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry that behaves like a remote one: creation races are resolved by
/// the store, and every call takes a little time.
#[derive(Default)]
pub struct SlowRegistry {
    devices: tokio::sync::Mutex<HashMap<String, DeviceCredential>>,
    add_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl SlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceRegistry for SlowRegistry {
    async fn add_device(&self, name: &str) -> HubResult<DeviceCredential> {
        let call = self.add_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10 + (call as u64 % 3))).await;

        let mut devices = self.devices.lock().await;
        if devices.contains_key(name) {
            return Err(HubError::AlreadyExists(name.to_string()));
        }
        let credential = DeviceCredential {
            device_id: name.to_string(),
            primary_key: format!("key-{}", call),
        };
        devices.insert(name.to_string(), credential.clone());
        Ok(credential)
    }

    async fn get_device(&self, name: &str) -> HubResult<DeviceCredential> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.devices
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| HubError::fatal(format!("device '{}' not found", name)))
    }
}

/// Registry whose every call fails with the given error.
pub struct FailingRegistry(pub fn() -> HubError);

#[async_trait]
impl DeviceRegistry for FailingRegistry {
    async fn add_device(&self, _name: &str) -> HubResult<DeviceCredential> {
        Err((self.0)())
    }

    async fn get_device(&self, _name: &str) -> HubResult<DeviceCredential> {
        Err((self.0)())
    }
}
