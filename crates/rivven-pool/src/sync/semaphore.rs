//! Counting semaphore with a release ceiling and an atomic drain
//!
//! Permit state lives in a single `AtomicUsize` updated with CAS loops; waiters
//! park on a [`Notify`]. Three properties matter to the pool:
//!
//! - **Bounded release**: `release(n)` never raises the count above the
//!   maximum. Surplus releases are dropped, not queued, so the semaphore can be
//!   used as a coalescing "look at the work queue" signal.
//! - **Timed acquire**: `acquire_timeout` gives up after the deadline without
//!   consuming a permit.
//! - **Atomic drain**: `acquire_and_drain` takes one permit and then swaps the
//!   remainder to zero, so a single waiter absorbs every signal queued so far.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Deadline used when `now + timeout` does not fit in an `Instant` (30 years)
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating to a far-future deadline instead of overflowing
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Counting semaphore. The permit count always stays within `[0, maximum]`.
#[derive(Debug)]
pub struct Semaphore {
    permits: AtomicUsize,
    maximum: AtomicUsize,
    notify: Notify,
}

impl Semaphore {
    /// Create a semaphore holding `initial` permits, capped at `maximum`
    pub fn new(initial: usize, maximum: usize) -> Self {
        Self {
            permits: AtomicUsize::new(initial.min(maximum)),
            maximum: AtomicUsize::new(maximum),
            notify: Notify::new(),
        }
    }

    /// Create an empty semaphore without a practical ceiling
    pub fn unbounded() -> Self {
        Self::new(0, usize::MAX)
    }

    /// Current number of permits
    pub fn available_permits(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }

    /// Release ceiling
    pub fn maximum(&self) -> usize {
        self.maximum.load(Ordering::Acquire)
    }

    /// Change the release ceiling. Permits above the new ceiling are discarded.
    pub fn set_maximum(&self, maximum: usize) {
        self.maximum.store(maximum, Ordering::Release);
        self.permits.fetch_min(maximum, Ordering::AcqRel);
    }

    /// Take one permit if one is available
    pub fn try_acquire(&self) -> bool {
        loop {
            let current = self.permits.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if self
                .permits
                .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            std::hint::spin_loop();
        }
    }

    /// Wait until a permit is available and take it
    pub async fn acquire(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await still wakes us.
            notified.as_mut().enable();
            if self.try_acquire() {
                return;
            }
            notified.await;
        }
    }

    /// Wait at most `timeout` for a permit. Returns `false` on timeout.
    pub async fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_acquire() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_acquire();
            }
        }
    }

    /// Take one permit, then discard any others that are queued
    pub async fn acquire_and_drain(&self) {
        self.acquire().await;
        self.drain();
    }

    /// Timed variant of [`acquire_and_drain`](Self::acquire_and_drain)
    pub async fn acquire_and_drain_timeout(&self, timeout: Duration) -> bool {
        let acquired = self.acquire_timeout(timeout).await;
        if acquired {
            self.drain();
        }
        acquired
    }

    /// Zero the permit count, returning how many permits were discarded
    pub fn drain(&self) -> usize {
        self.permits.swap(0, Ordering::AcqRel)
    }

    /// Add `permits`, capped at the maximum. Returns `false` if the semaphore
    /// was already full and nothing was added.
    pub fn release(&self, permits: usize) -> bool {
        if permits == 0 {
            return false;
        }
        loop {
            let current = self.permits.load(Ordering::Acquire);
            let maximum = self.maximum.load(Ordering::Acquire);
            if current >= maximum {
                return false;
            }
            let next = current.saturating_add(permits).min(maximum);
            if self
                .permits
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.notify.notify_waiters();
                return true;
            }
            std::hint::spin_loop();
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_release_is_capped() {
        let semaphore = Semaphore::new(0, 3);
        assert!(semaphore.release(2));
        assert!(semaphore.release(5));
        assert_eq!(semaphore.available_permits(), 3);
        assert!(!semaphore.release(1));
        assert_eq!(semaphore.available_permits(), 3);
    }

    #[test]
    fn test_initial_clamped_to_maximum() {
        let semaphore = Semaphore::new(10, 4);
        assert_eq!(semaphore.available_permits(), 4);
    }

    #[test]
    fn test_set_maximum_discards_surplus() {
        let semaphore = Semaphore::new(5, 5);
        semaphore.set_maximum(2);
        assert_eq!(semaphore.available_permits(), 2);
        assert_eq!(semaphore.maximum(), 2);
    }

    #[test]
    fn test_try_acquire() {
        let semaphore = Semaphore::new(1, 1);
        assert!(semaphore.try_acquire());
        assert!(!semaphore.try_acquire());
    }

    #[tokio::test]
    async fn test_drain_leaves_nothing() {
        let semaphore = Semaphore::unbounded();
        semaphore.release(4);
        semaphore.acquire_and_drain().await;
        assert_eq!(semaphore.available_permits(), 0);
        assert!(!semaphore.acquire_timeout(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_acquire_timeout_expires() {
        let semaphore = Semaphore::unbounded();
        let start = std::time::Instant::now();
        assert!(!semaphore.acquire_timeout(Duration::from_millis(20)).await);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_deadline_saturates() {
        let before = Instant::now();
        assert!(deadline_after(Duration::MAX) > before + Duration::from_secs(86400 * 365));
        assert!(deadline_after(Duration::ZERO) >= before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unbounded_timeout_still_acquires() {
        let semaphore = Arc::new(Semaphore::unbounded());
        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move { semaphore.acquire_timeout(Duration::MAX).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        semaphore.release(1);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_wakes_waiter() {
        let semaphore = Arc::new(Semaphore::unbounded());
        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move { semaphore.acquire_timeout(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        semaphore.release(1);
        assert!(waiter.await.unwrap());
        assert_eq!(semaphore.available_permits(), 0);
    }
}
