//! Bounded mailbox with drop-oldest overflow, shared by Bus subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, Notify};

pub struct Mailbox<T> {
    capacity: usize,
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    pub dropped: AtomicU64,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push a value, dropping the oldest queued entry on overflow.
    pub async fn push(&self, value: T) {
        let mut q = self.queue.lock().await;
        if q.len() >= self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(value);
        drop(q);
        self.notify.notify_one();
    }

    /// Pop the next value, waiting if the mailbox is empty.
    pub async fn recv(&self) -> T {
        loop {
            {
                let mut q = self.queue.lock().await;
                if let Some(v) = q.pop_front() {
                    return v;
                }
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_oldest_on_overflow() {
        let mb: Mailbox<u32> = Mailbox::new(2);
        mb.push(1).await;
        mb.push(2).await;
        mb.push(3).await;
        assert_eq!(mb.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(mb.recv().await, 2);
        assert_eq!(mb.recv().await, 3);
    }
}
