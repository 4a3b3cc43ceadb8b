#![forbid(unsafe_code)]

use std::time::Duration;

use kwork_core::Key;
use kwork_queue::{ItemExponentialFailureRateLimiter, WorkQueue};

fn queue() -> WorkQueue {
    WorkQueue::new("test", ItemExponentialFailureRateLimiter::new(Duration::from_millis(10), Duration::from_secs(1)))
}

fn k(s: &str) -> Key { Key::from(s) }

#[tokio::test]
async fn duplicate_adds_collapse() {
    let q = queue();
    q.add(k("ns/a"));
    q.add(k("ns/a"));
    q.add(k("ns/b"));
    q.add(k("ns/a"));
    assert_eq!(q.len(), 2);
    assert_eq!(q.get().await, Some(k("ns/a")));
    assert_eq!(q.get().await, Some(k("ns/b")));
    assert!(q.is_empty());
}

#[tokio::test]
async fn re_add_while_processing_requeues_once_on_done() {
    let q = queue();
    q.add(k("ns/pod1"));
    let got = q.get().await.unwrap();
    // three changes land while the key is in flight
    q.add(k("ns/pod1"));
    q.add(k("ns/pod1"));
    q.add(k("ns/pod1"));
    assert_eq!(q.len(), 0, "processing key must not be queued twice");
    q.done(&got);
    assert_eq!(q.len(), 1);
    let again = q.get().await.unwrap();
    q.done(&again);
    assert!(q.is_empty(), "exactly one follow-up sync");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn key_is_exclusive_until_done() {
    let q = queue();
    q.add(k("ns/a"));
    let first = q.get().await.unwrap();
    q.add(k("ns/a"));

    let q2 = q.clone();
    let second = tokio::spawn(async move { q2.get().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished(), "second get must block while ns/a is processing");

    q.done(&first);
    let got = tokio::time::timeout(Duration::from_secs(2), second).await.unwrap().unwrap();
    assert_eq!(got, Some(k("ns/a")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_getters_never_share_a_key() {
    let q = queue();
    for i in 0..50 {
        q.add(k(&format!("ns/p{}", i)));
    }
    let mut handles = Vec::new();
    for _ in 0..4 {
        let q = q.clone();
        handles.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(Some(key)) = tokio::time::timeout(Duration::from_millis(100), q.get()).await {
                seen.push(key.clone());
                q.done(&key);
            }
            seen
        }));
    }
    let mut all: Vec<Key> = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    all.sort();
    let before = all.len();
    all.dedup();
    assert_eq!(before, 50);
    assert_eq!(all.len(), 50);
}

#[tokio::test]
async fn shutdown_wakes_blocked_getters() {
    let q = queue();
    let q2 = q.clone();
    let waiter = tokio::spawn(async move { q2.get().await });
    tokio::task::yield_now().await;
    q.shut_down();
    assert_eq!(waiter.await.unwrap(), None);
    q.add(k("ns/late"));
    assert!(q.is_empty(), "adds after shutdown are ignored");
    assert!(q.is_shutting_down());
}

#[tokio::test]
async fn shutdown_drains_pending_keys_first() {
    let q = queue();
    q.add(k("a"));
    q.add(k("b"));
    q.shut_down();
    assert_eq!(q.get().await, Some(k("a")));
    assert_eq!(q.get().await, Some(k("b")));
    assert_eq!(q.get().await, None);
}

#[tokio::test]
async fn shut_down_with_drain_waits_for_in_flight() {
    let q = queue();
    q.add(k("a"));
    let key = q.get().await.unwrap();
    let q2 = q.clone();
    let drain = tokio::spawn(async move { q2.shut_down_with_drain().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!drain.is_finished());
    q.done(&key);
    tokio::time::timeout(Duration::from_secs(1), drain).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn rate_limited_requeue_waits_for_backoff() {
    let q = queue();
    let key = k("ns/pod2");
    q.add_rate_limited(key.clone());
    assert_eq!(q.num_requeues(&key), 1);
    assert_eq!(q.len(), 0);
    assert_eq!(q.delayed(), 1);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(q.len(), 0, "still backing off");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(q.len(), 1);
    assert_eq!(q.delayed(), 0);

    // second failure doubles the delay
    let got = q.get().await.unwrap();
    q.add_rate_limited(got.clone());
    q.done(&got);
    assert_eq!(q.num_requeues(&key), 2);
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert_eq!(q.len(), 0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(q.len(), 1);

    q.forget(&key);
    assert_eq!(q.num_requeues(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn delayed_adds_keep_earliest_deadline() {
    let q = queue();
    q.add_after(k("a"), Duration::from_millis(100));
    q.add_after(k("a"), Duration::from_millis(10));
    q.add_after(k("a"), Duration::from_millis(50));
    assert_eq!(q.delayed(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let got = q.get().await.unwrap();
    q.done(&got);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(q.is_empty(), "superseded timers must not fire");
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_delayed_adds() {
    let q = queue();
    q.add_after(k("a"), Duration::from_millis(10));
    q.shut_down();
    assert_eq!(q.delayed(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(q.get().await, None);
}

#[tokio::test(start_paused = true)]
async fn unbounded_delay_parks_key_without_blocking_fresh_adds() {
    let q = queue();
    q.add_after(k("ns/pod2"), Duration::MAX);
    assert_eq!(q.delayed(), 1);
    assert!(q.is_empty());

    // a new change still gets through while the retry is parked
    q.add(k("ns/pod2"));
    let got = q.get().await.unwrap();
    assert_eq!(got, k("ns/pod2"));
    q.done(&got);
}
