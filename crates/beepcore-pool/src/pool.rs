use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::queue::BlockingQueue;
use crate::sync::lock;

/// A unit of work executed by a worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Items travelling through the pool queue.
pub enum PoolMessage {
    /// Run this closure (skipped once the pool is stopping).
    Task(Task),
    /// The worker popping this leaves the pool and acknowledges with
    /// [`PoolMessage::StoppedAck`].
    StopOne,
    /// Shutdown beacon: exit if the pool is stopping, ignore otherwise.
    StopInProgress,
    /// A worker left through `StopOne`; the popping worker reaps it.
    StoppedAck,
}

impl fmt::Debug for PoolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolMessage::Task(_) => f.write_str("Task(..)"),
            PoolMessage::StopOne => f.write_str("StopOne"),
            PoolMessage::StopInProgress => f.write_str("StopInProgress"),
            PoolMessage::StoppedAck => f.write_str("StoppedAck"),
        }
    }
}

/// Snapshot returned by [`WorkerPool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers currently in the pool.
    pub running: usize,
    /// Workers blocked waiting for work.
    pub waiting: usize,
    /// Queued items not yet picked up.
    pub pending: usize,
}

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    running: Vec<Worker>,
    stopped: VecDeque<Worker>,
    /// `StopOne` messages queued but not yet consumed.
    pending_stops: usize,
}

struct PoolInner {
    queue: BlockingQueue<PoolMessage>,
    workers: Mutex<Workers>,
    stopping: AtomicBool,
    next_id: AtomicUsize,
}

/// Resizable set of worker threads sharing one task queue.
///
/// Dropping the pool stops it.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Start a pool with `threads` workers.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(PoolError::NoThreads);
        }

        let pool = Self {
            inner: Arc::new(PoolInner {
                queue: BlockingQueue::new(),
                workers: Mutex::new(Workers::default()),
                stopping: AtomicBool::new(false),
                next_id: AtomicUsize::new(0),
            }),
        };
        pool.spawn_workers(threads)?;
        debug!(threads, "worker pool started");
        Ok(pool)
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::new(config.threads)
    }

    fn spawn_workers(&self, count: usize) -> Result<()> {
        let mut workers = lock(&self.inner.workers);
        for _ in 0..count {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name(format!("beepcore-worker-{id}"))
                .spawn(move || worker_loop(inner, id))?;
            workers.running.push(Worker { id, handle });
        }
        Ok(())
    }

    /// Grow the pool by `count` workers.
    pub fn add(&self, count: usize) -> Result<()> {
        if self.is_stopping() {
            return Err(PoolError::Stopping);
        }
        self.spawn_workers(count)?;
        debug!(added = count, "worker pool grown");
        Ok(())
    }

    /// Shrink the pool by up to `count` workers, never below one.
    ///
    /// Returns how many stop requests were queued. Workers leave once they
    /// pop their request, so the running count drops asynchronously.
    pub fn remove(&self, count: usize) -> usize {
        if self.is_stopping() {
            return 0;
        }
        let mut workers = lock(&self.inner.workers);
        let mut remaining = workers.running.len().saturating_sub(workers.pending_stops);
        let mut queued = 0;
        while queued < count && remaining > 1 {
            self.inner.queue.push(PoolMessage::StopOne);
            workers.pending_stops += 1;
            remaining -= 1;
            queued += 1;
        }
        debug!(requested = count, queued, "worker pool shrinking");
        queued
    }

    /// Queue `task` for execution. Returns false (and drops the task) when
    /// the pool is stopping.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopping() {
            debug!("task submitted to a stopping pool, discarded");
            return false;
        }
        self.inner.queue.push(PoolMessage::Task(Box::new(task)));
        true
    }

    pub fn stats(&self) -> PoolStats {
        let running = lock(&self.inner.workers).running.len();
        PoolStats {
            running,
            waiting: self.inner.queue.waiters(),
            pending: self.inner.queue.len(),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Stop every worker and discard queued tasks.
    ///
    /// Joins all workers except the calling thread, so it is safe to call
    /// from inside a task.
    pub fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        let (running, stopped) = {
            let mut workers = lock(&self.inner.workers);
            let running = std::mem::take(&mut workers.running);
            let stopped = std::mem::take(&mut workers.stopped);
            (running, stopped)
        };

        for _ in 0..running.len() {
            self.inner.queue.push(PoolMessage::StopInProgress);
        }
        debug!(workers = running.len(), "worker pool stopping");

        let current = thread::current().id();
        for worker in running.into_iter().chain(stopped) {
            if worker.handle.thread().id() == current {
                continue;
            }
            if worker.handle.join().is_err() {
                warn!(worker = worker.id, "worker exited by panic");
            }
        }

        while let Some(message) = self.inner.queue.try_pop() {
            if matches!(message, PoolMessage::Task(_)) {
                debug!("queued task discarded at shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

fn worker_loop(inner: Arc<PoolInner>, id: usize) {
    loop {
        match inner.queue.pop() {
            PoolMessage::StoppedAck => reap_stopped(&inner),
            PoolMessage::StopOne => {
                let mut workers = lock(&inner.workers);
                workers.pending_stops = workers.pending_stops.saturating_sub(1);
                if let Some(pos) = workers.running.iter().position(|worker| worker.id == id) {
                    let worker = workers.running.remove(pos);
                    workers.stopped.push_back(worker);
                }
                drop(workers);
                inner.queue.push(PoolMessage::StoppedAck);
                debug!(worker = id, "worker left the pool");
                return;
            }
            PoolMessage::StopInProgress => {
                if inner.stopping.load(Ordering::Acquire) {
                    return;
                }
            }
            PoolMessage::Task(task) => {
                if inner.stopping.load(Ordering::Acquire) {
                    continue;
                }
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(worker = id, "task panicked");
                }
            }
        }
    }
}

fn reap_stopped(inner: &PoolInner) {
    let worker = lock(&inner.workers).stopped.pop_front();
    if let Some(worker) = worker {
        if worker.handle.join().is_err() {
            warn!(worker = worker.id, "stopped worker exited by panic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_submit_runs_task() {
        let pool = WorkerPool::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        assert!(pool.submit(move || tx.send(42).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(PoolError::NoThreads)));
    }

    #[rstest]
    #[case(3, 1, 1, 2)]
    #[case(3, 10, 2, 1)]
    #[case(1, 1, 0, 1)]
    fn test_remove_stops_requested_workers(
        #[case] threads: usize,
        #[case] requested: usize,
        #[case] removed: usize,
        #[case] left: usize,
    ) {
        let pool = WorkerPool::new(threads).unwrap();
        assert_eq!(pool.remove(requested), removed);
        assert!(wait_for(|| pool.stats().running == left));
    }

    #[test]
    fn test_remove_never_below_one() {
        let pool = WorkerPool::new(3).unwrap();
        assert_eq!(pool.remove(10), 2);
        assert_eq!(pool.remove(10), 0);
        assert!(wait_for(|| pool.stats().running == 1));

        let (tx, rx) = mpsc::channel();
        pool.submit(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.stats().running, 1);
    }

    #[test]
    fn test_add_grows_pool() {
        let pool = WorkerPool::new(1).unwrap();
        pool.add(3).unwrap();
        assert_eq!(pool.stats().running, 4);
        assert!(wait_for(|| pool.stats().waiting == 4));
    }

    #[test]
    fn test_stop_beacon_ignored_while_running() {
        let pool = WorkerPool::new(1).unwrap();
        pool.inner.queue.push(PoolMessage::StopInProgress);

        let (tx, rx) = mpsc::channel();
        pool.submit(move || tx.send("still alive").unwrap());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "still alive"
        );
        assert_eq!(pool.stats().running, 1);
    }

    #[test]
    fn test_stop_discards_new_tasks() {
        let pool = WorkerPool::new(2).unwrap();
        pool.stop();
        assert!(pool.is_stopping());
        assert!(!pool.submit(|| {}));
        assert_eq!(pool.stats().running, 0);
        assert!(matches!(pool.add(1), Err(PoolError::Stopping)));
    }

    #[test]
    fn test_panicking_task_keeps_worker() {
        let pool = WorkerPool::new(1).unwrap();
        pool.submit(|| panic!("callback failure"));

        let (tx, rx) = mpsc::channel();
        pool.submit(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.stats().running, 1);
    }

    #[test]
    fn test_stats_report_pending() {
        let pool = WorkerPool::new(1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.submit(|| {});
        pool.submit(|| {});
        let stats = pool.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.waiting, 0);
        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_stop_from_inside_task() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&pool);
        pool.submit(move || {
            inner.stop();
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(pool.is_stopping());
    }
}
