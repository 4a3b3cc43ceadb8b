#![forbid(unsafe_code)]

use std::time::Duration;

use kwork_core::Key;
use kwork_queue::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, ItemFastSlowRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};

fn ms(n: u64) -> Duration { Duration::from_millis(n) }

#[test]
fn exponential_doubles_then_caps() {
    let rl = ItemExponentialFailureRateLimiter::new(ms(5), ms(100));
    let key = Key::from("ns/a");
    let delays: Vec<_> = (0..7).map(|_| rl.when(&key)).collect();
    assert_eq!(delays, vec![ms(5), ms(10), ms(20), ms(40), ms(80), ms(100), ms(100)]);
    assert_eq!(rl.num_requeues(&key), 7);

    // other keys keep their own history
    assert_eq!(rl.when(&Key::from("ns/b")), ms(5));

    rl.forget(&key);
    assert_eq!(rl.num_requeues(&key), 0);
    assert_eq!(rl.when(&key), ms(5));
}

#[test]
fn exponential_survives_huge_exponents() {
    let rl = ItemExponentialFailureRateLimiter::new(ms(5), Duration::from_secs(1000));
    let key = Key::from("a");
    for _ in 0..64 {
        rl.when(&key);
    }
    assert_eq!(rl.when(&key), Duration::from_secs(1000));
}

#[test]
fn fast_then_slow() {
    let rl = ItemFastSlowRateLimiter::new(ms(1), ms(500), 2);
    let key = Key::from("a");
    assert_eq!(rl.when(&key), ms(1));
    assert_eq!(rl.when(&key), ms(1));
    assert_eq!(rl.when(&key), ms(500));
    assert_eq!(rl.num_requeues(&key), 3);
    rl.forget(&key);
    assert_eq!(rl.when(&key), ms(1));
}

#[tokio::test(start_paused = true)]
async fn bucket_allows_burst_then_spaces_out() {
    let rl = BucketRateLimiter::new(1.0, 2);
    let key = Key::from("a");
    assert_eq!(rl.when(&key), Duration::ZERO);
    assert_eq!(rl.when(&key), Duration::ZERO);
    assert_eq!(rl.when(&key), Duration::from_secs(1));
    assert_eq!(rl.when(&key), Duration::from_secs(2));
    assert_eq!(rl.num_requeues(&key), 0);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(rl.when(&key), Duration::ZERO, "bucket refills over time");
}

#[tokio::test(start_paused = true)]
async fn max_of_takes_longest_delay() {
    let rl = MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(ms(1), ms(1000))),
        Box::new(ItemFastSlowRateLimiter::new(ms(3), ms(700), 1)),
    ]);
    let key = Key::from("a");
    assert_eq!(rl.when(&key), ms(3));
    assert_eq!(rl.when(&key), ms(700));
    assert_eq!(rl.num_requeues(&key), 2);
    rl.forget(&key);
    assert_eq!(rl.num_requeues(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn default_limiter_starts_at_five_millis() {
    let rl = default_controller_rate_limiter();
    let key = Key::from("ns/pod1");
    assert_eq!(rl.when(&key), ms(5));
    assert_eq!(rl.when(&key), ms(10));
    assert_eq!(rl.num_requeues(&key), 2);
}
