//! Awaitable countdown counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// A counter that wakes waiters once it reaches zero.
///
/// Counting down past zero is a no-op, so a stray extra signal can never
/// wrap the counter around.
#[derive(Debug)]
pub struct Countdown {
    remaining: AtomicUsize,
    notify: Notify,
}

impl Countdown {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    /// Decrement once. Returns `true` if this call reached zero.
    pub fn count_down(&self) -> bool {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                self.notify.notify_waiters();
                true
            }
            _ => false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn is_zero(&self) -> bool {
        self.remaining() == 0
    }

    /// Wait until the counter reaches zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_zero() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_count_down_saturates() {
        let countdown = Countdown::new(2);
        assert!(!countdown.count_down());
        assert!(countdown.count_down());
        assert!(!countdown.count_down());
        assert_eq!(countdown.remaining(), 0);
    }

    #[tokio::test]
    async fn test_zero_count_does_not_block() {
        Countdown::new(0).wait().await;
    }

    #[tokio::test]
    async fn test_wait_wakes_on_zero() {
        let countdown = Arc::new(Countdown::new(2));

        let waiter = {
            let countdown = countdown.clone();
            tokio::spawn(async move { countdown.wait().await })
        };

        countdown.count_down();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        countdown.count_down();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
