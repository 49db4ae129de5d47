//! One-shot value that many tasks can await.
//!
//! The first [`Waiter::set`] wins; later calls are ignored. Waiting tasks
//! can be interrupted by a cancellation token or a deadline.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    Cancelled,
    Timeout,
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Cancelled => write!(f, "wait cancelled"),
            WaitError::Timeout => write!(f, "wait timed out"),
        }
    }
}

impl std::error::Error for WaitError {}

#[derive(Debug)]
pub struct Waiter<T> {
    slot: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Waiter<T> {
    fn clone(&self) -> Self {
        Self { slot: Arc::clone(&self.slot) }
    }
}

impl<T: Clone> Default for Waiter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Waiter<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot: Arc::new(slot) }
    }

    /// Store `value` if nothing was stored yet. Returns whether it was stored.
    pub fn set(&self, value: T) -> bool {
        let mut value = Some(value);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    /// Number of live handles sharing this waiter.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.slot)
    }

    pub fn get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // the sender lives in `self`, so the channel cannot close here
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub async fn wait_until(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<T, WaitError> {
        tokio::select! {
            value = self.wait() => Ok(value),
            _ = tokio::time::sleep_until(deadline) => Err(WaitError::Timeout),
            _ = cancel.cancelled() => Err(WaitError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_set_wins() {
        let waiter = Waiter::new();
        assert!(waiter.set(1));
        assert!(!waiter.set(2));
        assert_eq!(waiter.get(), Some(1));
        assert_eq!(waiter.wait().await, 1);
    }

    #[tokio::test]
    async fn wakes_pending_waiters() {
        let waiter: Waiter<&'static str> = Waiter::new();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let waiter = waiter.clone();
                tokio::spawn(async move { waiter.wait().await })
            })
            .collect();
        tokio::task::yield_now().await;
        waiter.set("ready");
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "ready");
        }
    }

    #[test]
    fn handles_are_counted() {
        let waiter: Waiter<u8> = Waiter::new();
        let other = waiter.clone();
        assert_eq!(waiter.handle_count(), 2);
        drop(other);
        assert_eq!(waiter.handle_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_and_cancel() {
        let waiter: Waiter<u8> = Waiter::new();
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(waiter.wait_until(deadline, &cancel).await, Err(WaitError::Timeout));

        cancel.cancel();
        let deadline = Instant::now() + Duration::from_secs(60);
        assert_eq!(waiter.wait_until(deadline, &cancel).await, Err(WaitError::Cancelled));
    }
}
