use crate::common::{ConsumerStep, OpenStep, ScriptedEventSource};
use hub_device_sim::config::ConnectionDescriptor;
use hub_device_sim::device::stream::StreamState;
use hub_device_sim::device::{EventStreamReceiver, RetryPolicy};
use hub_device_sim::error::{ErrorKind, HubError};
use hub_device_sim::hub::StreamEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tests for the event stream consume loop, run on a paused clock

fn hub_descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor::parse(crate::test_config::TEST_HUB_CONNECTION).unwrap()
}

fn receiver(source: Arc<ScriptedEventSource>) -> EventStreamReceiver<Arc<ScriptedEventSource>> {
    EventStreamReceiver::new(
        source,
        hub_descriptor(),
        "$Default",
        RetryPolicy::fixed(Duration::from_secs(1)),
    )
}

fn event(partition: &str, data: &str) -> ConsumerStep {
    ConsumerStep::Event(StreamEvent::new(partition, data.as_bytes().to_vec()))
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_reconnect_keeps_delivering() {
    let source = Arc::new(ScriptedEventSource::new(vec![
        OpenStep::Fail(HubError::timeout("no CONNACK")),
        OpenStep::Consumer(vec![event("0", "a"), event("1", "b")]),
    ]));
    let (sender, mut events) = mpsc::unbounded_channel();
    let mut receiver = receiver(source.clone()).with_forwarder(sender);

    let cancel = CancellationToken::new();
    let run_token = cancel.clone();
    let handle = tokio::spawn(async move { receiver.run(run_token).await });

    assert_eq!(events.recv().await.unwrap().text().as_deref(), Some("a"));
    assert_eq!(events.recv().await.unwrap().text().as_deref(), Some("b"));
    cancel.cancel();

    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.events, 2);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(source.opens(), 2);

    let opened = source.open_times();
    assert!(opened[1] - opened[0] >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_mid_stream_replaces_the_consumer() {
    let source = Arc::new(ScriptedEventSource::new(vec![
        OpenStep::Consumer(vec![
            event("0", "a"),
            ConsumerStep::Fail(HubError::timeout("no event within the receive window")),
        ]),
        OpenStep::Consumer(vec![event("2", "b")]),
    ]));
    let (sender, mut events) = mpsc::unbounded_channel();
    let mut receiver = receiver(source.clone()).with_forwarder(sender);

    let cancel = CancellationToken::new();
    let run_token = cancel.clone();
    let handle = tokio::spawn(async move { receiver.run(run_token).await });

    assert_eq!(events.recv().await.unwrap().text().as_deref(), Some("a"));
    let second = events.recv().await.unwrap();
    assert_eq!(second.partition_id, "2");
    assert_eq!(second.text().as_deref(), Some("b"));

    // The timed-out consumer is closed; its replacement is still open.
    assert_eq!(source.opens(), 2);
    assert_eq!(source.closes(), source.opens() - 1);

    cancel.cancel();
    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.events, 2);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(source.closes(), source.opens());

    let opened = source.open_times();
    assert!(opened[1] - opened[0] >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_error_exits_without_reconnecting() {
    let source = Arc::new(ScriptedEventSource::new(vec![OpenStep::Fail(HubError::Cancelled)]));
    let mut receiver = receiver(source.clone());

    let stats = receiver.run(CancellationToken::new()).await.unwrap();

    assert_eq!(source.opens(), 1);
    assert_eq!(stats.reconnects, 0);
    assert_eq!(receiver.state(), StreamState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_mid_stream_closes_the_consumer() {
    let source = Arc::new(ScriptedEventSource::new(vec![OpenStep::Consumer(vec![
        event("0", "a"),
        ConsumerStep::Fail(HubError::Cancelled),
    ])]));
    let mut receiver = receiver(source.clone());

    let stats = receiver.run(CancellationToken::new()).await.unwrap();

    assert_eq!(stats.events, 1);
    assert_eq!(source.opens(), 1);
    assert_eq!(source.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_read_error_reconnects_and_closes() {
    let source = Arc::new(ScriptedEventSource::new(vec![
        OpenStep::Consumer(vec![event("0", "a"), ConsumerStep::Fail(HubError::transient("reset"))]),
        OpenStep::Consumer(vec![event("0", "b"), ConsumerStep::Fail(HubError::Cancelled)]),
    ]));
    let mut receiver = receiver(source.clone());

    let stats = receiver.run(CancellationToken::new()).await.unwrap();

    assert_eq!(stats.events, 2);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(source.opens(), 2);
    assert_eq!(source.closes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stream_end_triggers_reconnect() {
    let source = Arc::new(ScriptedEventSource::new(vec![
        OpenStep::Consumer(vec![event("0", "a"), ConsumerStep::End]),
        OpenStep::Fail(HubError::Cancelled),
    ]));
    let mut receiver = receiver(source.clone());

    let stats = receiver.run(CancellationToken::new()).await.unwrap();
    assert_eq!(stats.events, 1);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(source.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_empty_events_are_skipped() {
    let source = Arc::new(ScriptedEventSource::new(vec![OpenStep::Consumer(vec![
        ConsumerStep::Event(StreamEvent::empty("2")),
        event("2", "x"),
        ConsumerStep::Fail(HubError::Cancelled),
    ])]));
    let (sender, mut events) = mpsc::unbounded_channel();
    let mut receiver = receiver(source).with_forwarder(sender);

    let stats = receiver.run(CancellationToken::new()).await.unwrap();
    assert_eq!(stats.events, 1);
    assert_eq!(stats.skipped, 1);

    drop(receiver);
    assert_eq!(events.recv().await.unwrap().text().as_deref(), Some("x"));
    assert!(events.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_open_error_stops_the_loop() {
    let source = Arc::new(ScriptedEventSource::new(vec![OpenStep::Fail(HubError::fatal("bad credentials"))]));
    let mut receiver = receiver(source.clone());

    let err = receiver.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(source.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_bounded_policy_gives_up_on_repeated_timeouts() {
    let source = Arc::new(ScriptedEventSource::new(vec![
        OpenStep::Fail(HubError::timeout("1")),
        OpenStep::Fail(HubError::timeout("2")),
        OpenStep::Fail(HubError::timeout("3")),
    ]));
    let mut receiver = EventStreamReceiver::new(
        source.clone(),
        hub_descriptor(),
        "$Default",
        RetryPolicy::fixed(Duration::from_secs(1)).with_max_attempts(3),
    );

    let err = receiver.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, HubError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(source.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_for_events() {
    let source = Arc::new(ScriptedEventSource::new(vec![OpenStep::Consumer(vec![])]));
    let mut receiver = receiver(source.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    });

    let stats = receiver.run(cancel).await.unwrap();
    assert_eq!(stats.reconnects, 0);
    assert_eq!(source.opens(), 1);
    assert_eq!(source.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stream_descriptor_is_derived_from_the_hub() {
    let source = Arc::new(ScriptedEventSource::new(vec![OpenStep::Fail(HubError::Cancelled)]));
    let mut receiver = receiver(source.clone());
    receiver.run(CancellationToken::new()).await.unwrap();

    let descriptors = source.descriptors();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].host_name(), Some("test-hub.example.net"));
    assert_eq!(descriptors[0].shared_access_key_name(), Some("iothubowner"));
}
