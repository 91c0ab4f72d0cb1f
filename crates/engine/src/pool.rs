//! Delayed-dispatch worker pool.
//!
//! A fixed set of worker threads draining a time-ordered queue. Supervisors
//! hand over a closure keyed to fire at a point in time; workers sleep until
//! the earliest deadline and run tasks as they come due. Shutdown drops any
//! tasks still pending — durable state lives in the ledger, and the
//! compensation scheduler re-drives whatever never ran.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use chrono::{DateTime, Utc};
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    at: DateTime<Utc>,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    queue: Mutex<BinaryHeap<Entry>>,
    available: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

/// Scheduled-task pool for delayed dispatch.
pub struct DelayPool {
    inner: Arc<Inner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl DelayPool {
    /// Spawn `size` worker threads.
    pub fn new(size: usize) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });

        let workers = (0..size.max(1))
            .map(|i| {
                let inner = inner.clone();
                thread::Builder::new()
                    .name(format!("relay-delay-{i}"))
                    .spawn(move || worker_loop(inner))
                    .expect("failed to spawn delay pool worker")
            })
            .collect();

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Queue `task` to run no earlier than `at`. A deadline in the past
    /// fires as soon as a worker is free.
    pub fn schedule_at(&self, at: DateTime<Utc>, task: impl FnOnce() + Send + 'static) {
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.queue.lock().unwrap().push(Entry {
            at,
            seq,
            task: Box::new(task),
        });
        self.inner.available.notify_all();
    }

    /// Stop the workers. Pending tasks are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::SeqCst);
        self.inner.available.notify_all();
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }
        let dropped = self.inner.queue.lock().unwrap().len();
        if dropped > 0 {
            debug!(pending = dropped, "delay pool shut down with tasks pending");
        }
    }
}

fn worker_loop(inner: Arc<Inner>) {
    let mut queue = inner.queue.lock().unwrap();
    loop {
        if inner.shutdown.load(AtomicOrdering::SeqCst) {
            break;
        }
        let now = Utc::now();
        let due = queue.peek().map(|entry| entry.at <= now);
        match due {
            Some(true) => {
                let entry = queue.pop().expect("peeked entry vanished");
                drop(queue);
                (entry.task)();
                queue = inner.queue.lock().unwrap();
            }
            Some(false) => {
                let wait = (queue.peek().expect("peeked entry vanished").at - now)
                    .to_std()
                    .unwrap_or_default();
                let (guard, _) = inner.available.wait_timeout(queue, wait).unwrap();
                queue = guard;
            }
            None => {
                queue = inner.available.wait(queue).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_past_due_task_immediately() {
        let pool = DelayPool::new(2);
        let (tx, rx) = mpsc::channel();

        pool.schedule_at(Utc::now() - chrono::Duration::seconds(5), move || {
            tx.send("ran").unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "ran");
        pool.shutdown();
    }

    #[test]
    fn waits_for_the_deadline() {
        let pool = DelayPool::new(1);
        let (tx, rx) = mpsc::channel();

        let at = Utc::now() + chrono::Duration::milliseconds(150);
        pool.schedule_at(at, move || {
            tx.send(Utc::now()).unwrap();
        });

        let fired_at = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired_at >= at - chrono::Duration::milliseconds(10));
        pool.shutdown();
    }

    #[test]
    fn earlier_deadline_fires_first() {
        let pool = DelayPool::new(1);
        let (tx, rx) = mpsc::channel();

        let tx_late = tx.clone();
        pool.schedule_at(Utc::now() + chrono::Duration::milliseconds(200), move || {
            tx_late.send("late").unwrap();
        });
        pool.schedule_at(Utc::now() + chrono::Duration::milliseconds(50), move || {
            tx.send("early").unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "late");
        pool.shutdown();
    }

    #[test]
    fn shutdown_drops_pending_tasks() {
        let pool = DelayPool::new(1);
        let (tx, rx) = mpsc::channel::<&str>();

        pool.schedule_at(Utc::now() + chrono::Duration::seconds(60), move || {
            tx.send("should not run").unwrap();
        });
        pool.shutdown();

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
