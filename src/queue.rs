//! Multi-producer, multi-consumer write-back queue. A fixed set of worker
//! threads drains a shared FIFO, invoking the handler for each item;
//! `barrier` blocks until the queue is empty and every worker has finished
//! the item it picked up, so all handler-visible writes are complete when it
//! returns. Ordering between distinct items is not preserved.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error};

use crate::error::Result;

pub type Handler<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

pub struct WriteQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Wakes workers when items arrive or shutdown begins.
    work: Condvar,
    /// Wakes barrier callers when the queue fully drains.
    drained: Condvar,
    handler: Handler<T>,
    counters: Counters,
}

struct State<T> {
    queue: VecDeque<T>,
    busy: usize,
    shutdown: bool,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    flushes: AtomicU64,
    drains: AtomicU64,
    drain_total_ms: AtomicU64,
    drain_slowest_ms: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time view of queue activity.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub enqueued: u64,
    pub flushes: u64,
    pub drains: u64,
    pub drain_total_ms: u64,
    pub drain_slowest_ms: u64,
    pub failures: u64,
    pub pending: usize,
    pub busy: usize,
}

impl<T: Send + 'static> WriteQueue<T> {
    /// Spawns `workers` threads draining the queue through `handler`.
    /// Handler failures are counted and logged; the queue keeps going.
    pub fn spawn(name: &str, workers: usize, handler: Handler<T>) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                busy: 0,
                shutdown: false,
            }),
            work: Condvar::new(),
            drained: Condvar::new(),
            handler,
            counters: Counters::default(),
        });
        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(shared))?;
            handles.push(handle);
        }
        Ok(Self {
            shared,
            workers: handles,
        })
    }

    /// O(1); never blocks beyond the queue mutex.
    pub fn enqueue(&self, item: T) {
        let mut state = self.shared.state.lock();
        state.queue.push_back(item);
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.work.notify_one();
    }

    /// Blocks until the queue is empty and every worker is idle. At that
    /// point all writes performed for previously enqueued items have
    /// completed.
    pub fn barrier(&self) {
        let counters = &self.shared.counters;
        counters.flushes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.state.lock();
        if state.queue.is_empty() && state.busy == 0 {
            return;
        }
        counters.drains.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        while !(state.queue.is_empty() && state.busy == 0) {
            self.shared.drained.wait(&mut state);
        }
        drop(state);
        let ms = start.elapsed().as_millis() as u64;
        counters.drain_total_ms.fetch_add(ms, Ordering::Relaxed);
        counters.drain_slowest_ms.fetch_max(ms, Ordering::Relaxed);
        debug!(wait_ms = ms, "queue.barrier.drained");
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let (pending, busy) = {
            let state = self.shared.state.lock();
            (state.queue.len(), state.busy)
        };
        let c = &self.shared.counters;
        QueueSnapshot {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            drains: c.drains.load(Ordering::Relaxed),
            drain_total_ms: c.drain_total_ms.load(Ordering::Relaxed),
            drain_slowest_ms: c.drain_slowest_ms.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            pending,
            busy,
        }
    }
}

impl<T: Send + 'static> Drop for WriteQueue<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work.notify_all();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T: Send + 'static>(shared: Arc<Shared<T>>) {
    loop {
        let item = {
            let mut state = shared.state.lock();
            loop {
                if let Some(item) = state.queue.pop_front() {
                    state.busy += 1;
                    break item;
                }
                // Drain everything before honoring shutdown, so teardown
                // flushes pending stores.
                if state.shutdown {
                    return;
                }
                shared.work.wait(&mut state);
            }
        };
        if let Err(err) = (shared.handler)(&item) {
            shared.counters.failures.fetch_add(1, Ordering::Relaxed);
            error!(error = %err, "queue.worker.store_failed");
        }
        let mut state = shared.state.lock();
        state.busy -= 1;
        if state.queue.is_empty() && state.busy == 0 {
            shared.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::error::StoreError;

    #[test]
    fn barrier_waits_for_all_items() {
        let done = Arc::new(AtomicUsize::new(0));
        let seen = done.clone();
        let queue: WriteQueue<u32> = WriteQueue::spawn(
            "wq-test",
            4,
            Arc::new(move |_| {
                thread::sleep(Duration::from_millis(2));
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
        for i in 0..64 {
            queue.enqueue(i);
        }
        queue.barrier();
        assert_eq!(done.load(Ordering::SeqCst), 64);
        assert_eq!(queue.pending(), 0);
        let snap = queue.snapshot();
        assert_eq!(snap.enqueued, 64);
        assert_eq!(snap.busy, 0);
    }

    #[test]
    fn failures_are_counted_not_fatal() {
        let queue: WriteQueue<u32> = WriteQueue::spawn(
            "wq-fail",
            2,
            Arc::new(|n| {
                if *n % 2 == 0 {
                    Err(StoreError::Sql("boom".into()))
                } else {
                    Ok(())
                }
            }),
        )
        .unwrap();
        for i in 0..10 {
            queue.enqueue(i);
        }
        queue.barrier();
        assert_eq!(queue.snapshot().failures, 5);
    }

    #[test]
    fn drop_drains_remaining_items() {
        let done = Arc::new(AtomicUsize::new(0));
        let seen = done.clone();
        {
            let queue: WriteQueue<u32> = WriteQueue::spawn(
                "wq-drop",
                1,
                Arc::new(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
            for i in 0..16 {
                queue.enqueue(i);
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 16);
    }
}
