use bitflipper::engine::rate_gate::{required_wait, saturating_secs, RateGate, Stopped};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[test]
fn test_required_wait_math() {
    assert_eq!(required_wait(Duration::ZERO, 10.0, 0), None);
    assert_eq!(
        required_wait(Duration::ZERO, 10.0, 1),
        Some(Duration::from_millis(100))
    );
    assert_eq!(required_wait(Duration::from_millis(150), 10.0, 1), None);

    let wait = required_wait(Duration::from_millis(50), 10.0, 1).unwrap();
    assert!((wait.as_secs_f64() - 0.05).abs() < 1e-9);
}

#[test]
fn test_huge_waits_saturate() {
    assert_eq!(required_wait(Duration::ZERO, 1e-18, 1000), Some(Duration::MAX));
    assert_eq!(saturating_secs(1e30), Duration::MAX);
    assert_eq!(saturating_secs(-1.0), Duration::ZERO);
    assert_eq!(saturating_secs(1.5), Duration::from_millis(1500));
}

#[test]
fn test_unthrottled_requests_are_counted() {
    let gate = RateGate::new(1.0);
    assert_eq!(gate.record_unthrottled(), 0);
    assert_eq!(gate.record_unthrottled(), 1);
    assert_eq!(gate.sent(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_spaces_requests_by_rate() {
    let gate = RateGate::new(10.0);
    let stop = CancellationToken::new();
    let start = Instant::now();

    gate.record_unthrottled();
    assert_eq!(gate.acquire(&stop).await, Ok(1));
    assert!(start.elapsed() >= Duration::from_millis(100));

    assert_eq!(gate.acquire(&stop).await, Ok(2));
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(gate.sent(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_is_immediate_when_behind_schedule() {
    let gate = RateGate::new(10.0);
    let stop = CancellationToken::new();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let before = Instant::now();
    for _ in 0..5 {
        gate.acquire(&stop).await.unwrap();
    }
    assert_eq!(before.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn test_stop_interrupts_wait() {
    let gate = RateGate::new(0.001);
    let stop = CancellationToken::new();
    gate.record_unthrottled();
    stop.cancel();

    let res = tokio::time::timeout(Duration::from_secs(1), gate.acquire(&stop)).await;
    assert_eq!(res.unwrap(), Err(Stopped));
    // The reserved ticket still counts.
    assert_eq!(gate.sent(), 2);
}
