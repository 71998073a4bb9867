//! Tests for rivven-pool sync primitives

use rivven_pool::sync::{BlockingQueue, BoundedBlockingQueue, Semaphore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ==================== Semaphore Tests ====================

#[tokio::test]
async fn test_acquire_and_drain_coalesces_signals() {
    let semaphore = Semaphore::new(0, 10);
    for _ in 0..5 {
        semaphore.release(1);
    }
    assert_eq!(semaphore.available_permits(), 5);

    semaphore.acquire_and_drain().await;
    assert_eq!(semaphore.available_permits(), 0);
    assert!(!semaphore.acquire_and_drain_timeout(Duration::from_millis(10)).await);
}

#[tokio::test]
async fn test_single_permit_signal() {
    let semaphore = Semaphore::new(0, 1);
    assert!(semaphore.release(1));
    assert!(!semaphore.release(1));
    assert_eq!(semaphore.available_permits(), 1);
    assert_eq!(semaphore.drain(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_waiters_share_released_permits() {
    let semaphore = Arc::new(Semaphore::unbounded());
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move { semaphore.acquire_timeout(Duration::from_secs(2)).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    semaphore.release(3);

    for waiter in waiters {
        assert!(waiter.await.unwrap());
    }
    assert_eq!(semaphore.available_permits(), 0);
}

// ==================== Queue Tests ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remove_waits_for_producer() {
    let queue = Arc::new(BlockingQueue::new());
    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.remove().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.add("hello");
    assert_eq!(consumer.await.unwrap(), "hello");
    assert!(queue.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bounded_producer_waits_for_slot() {
    let queue = Arc::new(BoundedBlockingQueue::new(2));
    queue.add(1).await;
    queue.add(2).await;

    let third_added = Arc::new(AtomicBool::new(false));
    let producer = {
        let queue = Arc::clone(&queue);
        let third_added = Arc::clone(&third_added);
        tokio::spawn(async move {
            queue.add(3).await;
            third_added.store(true, Ordering::SeqCst);
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!third_added.load(Ordering::SeqCst));
    assert_eq!(queue.size(), 2);

    assert_eq!(queue.remove().await, 1);
    producer.await.unwrap();
    assert!(third_added.load(Ordering::SeqCst));
    assert_eq!(queue.size(), 2);

    assert_eq!(queue.remove().await, 2);
    assert_eq!(queue.remove_timeout(Duration::from_millis(10)).await, Some(3));
    assert_eq!(queue.remove_timeout(Duration::from_millis(10)).await, None);
}
