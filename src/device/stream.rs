use super::retry::{sleep_or_cancelled, RetryPolicy};
use crate::config::ConnectionDescriptor;
use crate::error::{ErrorKind, HubError, HubResult};
use crate::hub::{EventConsumer, EventSource, StreamEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Streaming,
    RecoverableError,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub events: u64,
    pub skipped: u64,
    pub reconnects: u64,
}

enum Attempt {
    Cancelled,
    Ended,
}

/// Reads the hub-wide event stream for one consumer group, reconnecting on
/// recoverable failures.
pub struct EventStreamReceiver<S> {
    source: S,
    hub_descriptor: ConnectionDescriptor,
    consumer_group: String,
    retry: RetryPolicy,
    forward: Option<mpsc::UnboundedSender<StreamEvent>>,
    state: StreamState,
}

impl<S: EventSource> EventStreamReceiver<S> {
    pub fn new(
        source: S,
        hub_descriptor: ConnectionDescriptor,
        consumer_group: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            hub_descriptor,
            consumer_group: consumer_group.into(),
            retry,
            forward: None,
            state: StreamState::Stopped,
        }
    }

    /// Also hands every non-empty event to `sender`.
    pub fn with_forwarder(mut self, sender: mpsc::UnboundedSender<StreamEvent>) -> Self {
        self.forward = Some(sender);
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> HubResult<ConsumeStats> {
        info!(
            "Starting event stream receiver for consumer group {}",
            self.consumer_group
        );

        let mut stats = ConsumeStats::default();
        let mut consecutive_failures = 0u32;

        while !cancel.is_cancelled() {
            let delivered_before = stats.events;
            let outcome = self.consume_once(&cancel, &mut stats).await;
            if stats.events > delivered_before {
                consecutive_failures = 0;
            }

            let err = match outcome {
                Ok(Attempt::Cancelled) => {
                    info!("Receive events cancelled. Exiting...");
                    break;
                }
                Ok(Attempt::Ended) => {
                    info!("Event stream ended, reconnecting");
                    None
                }
                Err(err) => match err.kind() {
                    ErrorKind::Cancelled => {
                        info!("Receive events cancelled. Exiting...");
                        break;
                    }
                    ErrorKind::Fatal => {
                        error!("Fatal error reading events: {}", err);
                        self.state = StreamState::Stopped;
                        return Err(err);
                    }
                    _ => Some(err),
                },
            };

            consecutive_failures += 1;
            let delay = self.retry.next_delay(consecutive_failures);
            match err {
                Some(err) if !self.retry.allows_retry(consecutive_failures) => {
                    error!(
                        "Error reading events: {}. Giving up after {} attempts",
                        err, consecutive_failures
                    );
                    self.state = StreamState::Stopped;
                    return Err(HubError::RetriesExhausted {
                        attempts: consecutive_failures,
                        last: Box::new(err),
                    });
                }
                Some(err) if err.kind() == ErrorKind::Timeout => warn!(
                    "Timeout receiving or connecting to the event stream: {}. Retrying after {:?}...",
                    err, delay
                ),
                Some(err) => warn!(
                    kind = %err.kind(),
                    "Error reading event: {}. Retrying after {:?}...",
                    err,
                    delay
                ),
                None => debug!("Reconnecting after {:?}", delay),
            }

            self.state = StreamState::RecoverableError;
            stats.reconnects += 1;
            if sleep_or_cancelled(&cancel, delay).await {
                info!("Receive events cancelled. Exiting...");
                break;
            }
        }

        self.state = StreamState::Stopped;
        info!(
            "Event stream receiver stopped ({} events, {} skipped, {} reconnects)",
            stats.events, stats.skipped, stats.reconnects
        );
        Ok(stats)
    }

    /// One connection attempt. The consumer is closed on every exit path.
    async fn consume_once(
        &mut self,
        cancel: &CancellationToken,
        stats: &mut ConsumeStats,
    ) -> HubResult<Attempt> {
        self.state = StreamState::Connecting;
        let descriptor = self.hub_descriptor.stream_descriptor()?;

        let mut consumer = tokio::select! {
            _ = cancel.cancelled() => return Ok(Attempt::Cancelled),
            opened = self.source.open_consumer(&self.consumer_group, &descriptor) => opened?,
        };

        self.state = StreamState::Streaming;
        let result = self.pump(consumer.as_mut(), cancel, stats).await;

        if let Err(e) = consumer.close().await {
            debug!("Failed to close event consumer: {}", e);
        }
        result
    }

    async fn pump(
        &self,
        consumer: &mut dyn EventConsumer,
        cancel: &CancellationToken,
        stats: &mut ConsumeStats,
    ) -> HubResult<Attempt> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(Attempt::Cancelled),
                next = consumer.next_event() => next?,
            };

            match next {
                Some(event) => self.handle_event(event, stats),
                None => return Ok(Attempt::Ended),
            }
        }
    }

    fn handle_event(&self, event: StreamEvent, stats: &mut ConsumeStats) {
        let data = match event.text() {
            Some(data) => data,
            None => {
                stats.skipped += 1;
                debug!("Skipping empty event on partition {}", event.partition_id);
                return;
            }
        };

        stats.events += 1;
        info!(
            "Message received. Partition: {} Data: '{}'",
            event.partition_id, data
        );

        if let Some(forward) = &self.forward {
            if forward.send(event).is_err() {
                debug!("Event forwarder closed, dropping event");
            }
        }
    }
}
