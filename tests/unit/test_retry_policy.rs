use hub_device_sim::device::retry::sleep_or_cancelled;
use hub_device_sim::device::RetryPolicy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[test]
fn test_unbounded_policy_always_retries() {
    let policy = RetryPolicy::default();
    assert!(policy.allows_retry(1));
    assert!(policy.allows_retry(u32::MAX));
    assert_eq!(policy.next_delay(1_000), Duration::from_secs(5));
}

#[test]
fn test_exponential_jitter_stays_under_the_cap() {
    let policy = RetryPolicy::exponential(Duration::from_millis(200), Duration::from_secs(4))
        .with_jitter(0.25);
    let mut rng = StdRng::seed_from_u64(7);

    for attempt in 1..=32 {
        let delay = policy.delay_with_rng(attempt, &mut rng);
        assert!(delay <= Duration::from_secs(5), "attempt {}: {:?}", attempt, delay);
        assert!(delay >= Duration::from_millis(150), "attempt {}: {:?}", attempt, delay);
    }
}

#[tokio::test(start_paused = true)]
async fn test_sleep_is_cut_short_by_cancellation() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    assert!(sleep_or_cancelled(&cancel, Duration::from_secs(60)).await);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_sleep_runs_to_completion_without_cancellation() {
    let cancel = CancellationToken::new();
    let started = Instant::now();
    assert!(!sleep_or_cancelled(&cancel, Duration::from_secs(5)).await);
    assert!(started.elapsed() >= Duration::from_secs(5));
}
