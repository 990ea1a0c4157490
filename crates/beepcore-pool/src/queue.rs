use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::sync::{lock, wait, wait_timeout};

/// Unbounded multi-producer/multi-consumer FIFO with blocking pops.
///
/// Tracks how many consumers are parked in [`pop`](Self::pop) so pool
/// statistics can report idle workers.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    waiters: usize,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                waiters: 0,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut state = lock(&self.state);
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
    }

    /// Block until an item is available.
    pub fn pop(&self) -> T {
        let mut state = lock(&self.state);
        loop {
            if let Some(item) = state.items.pop_front() {
                return item;
            }
            state.waiters += 1;
            state = wait(&self.ready, state);
            state.waiters -= 1;
        }
    }

    /// Block for at most `timeout`. Returns `None` when nothing arrived.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state.waiters += 1;
            let (guard, _) = wait_timeout(&self.ready, state, remaining);
            state = guard;
            state.waiters -= 1;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        lock(&self.state).items.pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).items.is_empty()
    }

    /// Consumers currently blocked waiting for an item.
    pub fn waiters(&self) -> usize {
        lock(&self.state).waiters
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = BlockingQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)), Some(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_timeout_expires() {
        let queue: BlockingQueue<u8> = BlockingQueue::new();
        let started = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(queue.waiters(), 0);
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = Arc::new(BlockingQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        while queue.waiters() == 0 {
            thread::yield_now();
        }
        queue.push("frame");
        assert_eq!(consumer.join().unwrap(), "frame");
    }
}
