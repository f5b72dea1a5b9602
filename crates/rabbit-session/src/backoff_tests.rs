//! Tests for the reconnect backoff

use super::*;
use std::time::Duration;

// ============================================================================
// BackoffPolicy Tests
// ============================================================================

#[test]
fn test_backoff_policy_default_values() {
    let policy = BackoffPolicy::default();

    assert_eq!(policy.initial_delay, Duration::from_millis(500));
    assert_eq!(policy.max_delay, Duration::from_millis(5000));
    assert_eq!(policy.multiplier, 2.0);
    assert!(!policy.use_jitter);
}

#[test]
fn test_default_delay_sequence() {
    let policy = BackoffPolicy::default();

    let delays: Vec<Duration> = (0..7).map(|attempt| policy.delay_for(attempt)).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(500),
            Duration::from_millis(1000),
            Duration::from_millis(2000),
            Duration::from_millis(4000),
            Duration::from_millis(5000),
            Duration::from_millis(5000),
            Duration::from_millis(5000),
        ]
    );
}

#[test]
fn test_delays_are_monotonic_without_jitter() {
    let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(3), 1.5);

    let mut previous = Duration::ZERO;
    for attempt in 0..50 {
        let delay = policy.delay_for(attempt);
        assert!(delay >= previous, "attempt {} went backwards", attempt);
        assert!(delay <= Duration::from_secs(3));
        previous = delay;
    }
}

#[test]
fn test_huge_attempt_numbers_stay_capped() {
    let policy = BackoffPolicy::default();
    assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(5000));
}

#[test]
fn test_shrinking_multiplier_is_raised() {
    let policy = BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(1), 0.5);
    assert_eq!(policy.multiplier, 1.0);
    assert_eq!(policy.delay_for(3), Duration::from_millis(200));
}

#[test]
fn test_jitter_stays_in_range() {
    let policy = BackoffPolicy::default().with_jitter().with_jitter_percent(0.2);

    for _ in 0..100 {
        let delay = policy.delay_for(1);
        assert!(delay >= Duration::from_millis(800));
        assert!(delay <= Duration::from_millis(1200));
    }
}

// ============================================================================
// BackoffState Tests
// ============================================================================

#[test]
fn test_state_advances_and_resets() {
    let policy = BackoffPolicy::default();
    let mut state = BackoffState::new();

    assert_eq!(state.next_delay(&policy), Duration::from_millis(500));
    assert_eq!(state.next_delay(&policy), Duration::from_millis(1000));
    assert_eq!(state.failures(), 2);

    state.reset();
    assert_eq!(state.failures(), 0);
    assert_eq!(state.next_delay(&policy), Duration::from_millis(500));
}
