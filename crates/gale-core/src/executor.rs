//! Fixed-size (but resizable) worker pool with NUMA-aware pinning.
//!
//! Producers push tasks into a shared bounded queue; workers spin-poll it
//! with adaptive backoff and yield when idle. Each worker can be pinned to
//! `(node, worker_index mod cpu_count)` at spawn. `close` refuses new
//! submissions, drains queued tasks for a bounded grace period, and joins
//! the workers.

use crate::affinity;
use crate::backoff::Backoff;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A parameterless unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue slots granted per worker.
const QUEUE_SLOTS_PER_WORKER: usize = 256;

/// Grace period `close` waits for queued tasks to drain.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct ExecInner {
    queue: Mutex<VecDeque<Task>>,
    capacity: AtomicUsize,
    closed: AtomicBool,
    node: i32,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Work pool of OS threads.
pub struct Executor {
    inner: Arc<ExecInner>,
    workers: Mutex<Vec<Worker>>,
}

impl Executor {
    /// Creates an executor with `worker_count` threads, pinned to `node`
    /// when `node >= 0` (CPU chosen as `worker_index mod cpu_count`).
    pub fn new(worker_count: usize, node: i32) -> Result<Self> {
        if worker_count == 0 {
            return Err(Error::InvalidArgument(
                "executor needs at least one worker".into(),
            ));
        }

        let inner = Arc::new(ExecInner {
            queue: Mutex::new(VecDeque::new()),
            capacity: AtomicUsize::new(worker_count * QUEUE_SLOTS_PER_WORKER),
            closed: AtomicBool::new(false),
            node,
        });

        let workers = (0..worker_count)
            .map(|index| spawn_worker(&inner, index))
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Submits a task for execution.
    ///
    /// Fails with `ExecutorClosed` after [`close`](Self::close) and with
    /// `ResourceExhausted` when the bounded queue is full.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ExecutorClosed);
        }

        let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.inner.capacity.load(Ordering::Relaxed) {
            return Err(Error::ResourceExhausted("task queue full"));
        }
        queue.push_back(Box::new(task));
        Ok(())
    }

    /// Current worker count.
    pub fn num_workers(&self) -> usize {
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Grows or shrinks the pool to `n` workers without dropping queued
    /// tasks (the shared queue is untouched; removed workers exit after
    /// their current task).
    pub fn resize(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(Error::InvalidArgument(
                "executor needs at least one worker".into(),
            ));
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ExecutorClosed);
        }

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        self.inner
            .capacity
            .store(n * QUEUE_SLOTS_PER_WORKER, Ordering::Relaxed);

        if n > workers.len() {
            for index in workers.len()..n {
                workers.push(spawn_worker(&self.inner, index)?);
            }
        } else {
            let removed: Vec<Worker> = workers.drain(n..).collect();
            for worker in &removed {
                worker.stop.store(true, Ordering::Release);
            }
            for worker in removed {
                let _ = worker.handle.join();
            }
        }
        Ok(())
    }

    /// Refuses new submissions, drains queued tasks up to a bounded grace,
    /// and joins all workers. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Workers exit on their next empty poll; give the queue a bounded
        // window to drain first.
        let deadline = Instant::now() + CLOSE_GRACE;
        loop {
            let empty = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty();
            if empty || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker in workers.iter() {
            worker.stop.store(true, Ordering::Release);
        }
        for worker in workers.drain(..) {
            let _ = worker.handle.join();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_worker(inner: &Arc<ExecInner>, index: usize) -> std::io::Result<Worker> {
    let stop = Arc::new(AtomicBool::new(false));
    let handle = {
        let inner = Arc::clone(inner);
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name(format!("gale-worker-{index}"))
            .spawn(move || worker_loop(&inner, index, &stop))?
    };
    Ok(Worker { stop, handle })
}

fn worker_loop(inner: &ExecInner, index: usize, stop: &AtomicBool) {
    if inner.node >= 0 {
        let cpu = (index % affinity::cpu_count()) as i32;
        if let Err(err) = affinity::pin_current_thread(cpu, inner.node) {
            tracing::debug!(worker = index, cpu, node = inner.node, %err, "worker pin failed");
        }
    }

    let mut backoff = Backoff::new();
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        let task = inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match task {
            Some(task) => {
                backoff.reset();
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::warn!(worker = index, "task panicked; worker continues");
                }
            }
            None => {
                // Shutdown signal is honored once the queue runs dry.
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                // Spin briefly, then yield, then sleep up to a millisecond.
                backoff.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn wait_for(predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_submit_runs_tasks() {
        let exec = Executor::new(2, -1).unwrap();
        let counter = Arc::new(AtomicU64::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            exec.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }

        wait_for(|| counter.load(Ordering::Relaxed) == 100);
        exec.close();
    }

    #[test]
    fn test_submit_after_close_rejected() {
        let exec = Executor::new(1, -1).unwrap();
        exec.close();
        assert!(matches!(exec.submit(|| {}), Err(Error::ExecutorClosed)));
    }

    #[test]
    fn test_close_drains_queued_tasks() {
        let exec = Executor::new(1, -1).unwrap();
        let counter = Arc::new(AtomicU64::new(0));

        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            exec.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }

        exec.close();
        assert_eq!(counter.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let exec = Executor::new(1, -1).unwrap();
        assert_eq!(exec.num_workers(), 1);

        exec.resize(4).unwrap();
        assert_eq!(exec.num_workers(), 4);

        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..200 {
            let counter = Arc::clone(&counter);
            exec.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }

        exec.resize(2).unwrap();
        assert_eq!(exec.num_workers(), 2);

        wait_for(|| counter.load(Ordering::Relaxed) == 200);
        exec.close();
    }

    #[test]
    fn test_queue_full_rejected() {
        let exec = Executor::new(1, -1).unwrap();

        let gate = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            exec.submit(move || {
                started.store(true, Ordering::Release);
                while !gate.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        }
        wait_for(|| started.load(Ordering::Acquire));

        // Worker is parked in the gate task, so the queue absorbs exactly
        // its capacity before rejecting.
        for _ in 0..QUEUE_SLOTS_PER_WORKER {
            exec.submit(|| {}).unwrap();
        }
        assert!(matches!(
            exec.submit(|| {}),
            Err(Error::ResourceExhausted(_))
        ));

        gate.store(true, Ordering::Release);
        exec.close();
    }
}
