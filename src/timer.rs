//! World timer queue.
//!
//! A min-heap of `(deadline, world)` pairs behind a lock. A single worker
//! waits on [`TimerQueue::wait`]; pushing an earlier deadline wakes it so it
//! can re-arm on the new head.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::waiter::WaitError;

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, Uuid)>>>,
    notify: Notify,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Reverse<(Instant, Uuid)>>> {
        self.heap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedule `world` to expire after `duration`.
    pub fn push(&self, world: Uuid, duration: Duration) {
        self.lock().push(Reverse((Instant::now() + duration, world)));
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Next expired world, in deadline order.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<Uuid, WaitError> {
        loop {
            let head = {
                let mut heap = self.lock();
                match heap.peek() {
                    Some(Reverse((deadline, _))) if *deadline <= Instant::now() => {
                        if let Some(Reverse((_, world))) = heap.pop() {
                            return Ok(world);
                        }
                        None
                    }
                    Some(Reverse((deadline, _))) => Some(*deadline),
                    None => None,
                }
            };

            match head {
                Some(deadline) => tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = self.notify.notified() => {}
                    _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                },
                None => tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_in_deadline_order() {
        let timers = TimerQueue::new();
        let cancel = CancellationToken::new();
        let late = Uuid::new_v4();
        let early = Uuid::new_v4();
        timers.push(late, Duration::from_millis(300));
        timers.push(early, Duration::from_millis(100));

        let start = Instant::now();
        assert_eq!(timers.wait(&cancel).await, Ok(early));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(timers.wait(&cancel).await, Ok(late));
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sooner_push_wakes_waiter() {
        let timers = std::sync::Arc::new(TimerQueue::new());
        let cancel = CancellationToken::new();
        let slow = Uuid::new_v4();
        let fast = Uuid::new_v4();
        timers.push(slow, Duration::from_secs(60));

        let waiter = {
            let timers = std::sync::Arc::clone(&timers);
            let cancel = cancel.clone();
            tokio::spawn(async move { timers.wait(&cancel).await })
        };
        tokio::task::yield_now().await;
        timers.push(fast, Duration::from_millis(10));

        let first = waiter.await.expect("waiter task");
        assert_eq!(first, Ok(fast));
        assert_eq!(timers.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let timers = TimerQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(timers.wait(&cancel).await, Err(WaitError::Cancelled));
    }
}
