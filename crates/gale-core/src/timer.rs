//! Min-heap scheduler for delayed callbacks with cancellation.
//!
//! A single driver thread sleeps until the earliest deadline (or a wake from
//! a new submission), pops due entries, and dispatches their callbacks.
//! Cancelled entries are tombstoned and skipped on pop. Callback panics are
//! isolated from the driver.

use crate::error::Result;
use crate::executor::Executor;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct TimerState {
    cancelled: AtomicBool,
    fired: AtomicBool,
}

/// Handle to a scheduled callback.
#[derive(Clone)]
pub struct TimerHandle {
    state: Arc<TimerState>,
}

impl TimerHandle {
    /// Cancels the callback. Idempotent; a no-op when it already fired.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once `cancel` was called.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Returns true once the callback was dispatched.
    pub fn has_fired(&self) -> bool {
        self.state.fired.load(Ordering::Acquire)
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    callback: Box<dyn FnOnce() + Send + 'static>,
    state: Arc<TimerState>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline wins.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SchedulerInner {
    queue: Mutex<BinaryHeap<Entry>>,
    wake: Condvar,
    shutdown: AtomicBool,
    epoch: Instant,
    seq: AtomicU64,
    executor: Option<Arc<Executor>>,
}

/// Monotonic deadline scheduler with a dedicated driver thread.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a scheduler dispatching callbacks on the driver thread.
    pub fn new() -> Result<Self> {
        Self::build(None)
    }

    /// Creates a scheduler that hands due callbacks to `executor` instead of
    /// running them on the driver thread.
    pub fn with_executor(executor: Arc<Executor>) -> Result<Self> {
        Self::build(Some(executor))
    }

    fn build(executor: Option<Arc<Executor>>) -> Result<Self> {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(BinaryHeap::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            epoch: Instant::now(),
            seq: AtomicU64::new(0),
            executor,
        });

        let driver = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("gale-timer".into())
                .spawn(move || driver_loop(&inner))?
        };

        Ok(Self {
            inner,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Schedules `callback` to fire once the monotonic clock passes
    /// `now + delay`.
    pub fn schedule(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let state = Arc::new(TimerState {
            cancelled: AtomicBool::new(false),
            fired: AtomicBool::new(false),
        });
        let entry = Entry {
            deadline: Instant::now() + delay,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            callback: Box::new(callback),
            state: Arc::clone(&state),
        };

        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        self.inner.wake.notify_one();

        TimerHandle { state }
    }

    /// Cancels a scheduled callback. Idempotent; no error when it already
    /// fired or was cancelled before.
    pub fn cancel(&self, handle: &TimerHandle) {
        handle.cancel();
    }

    /// Monotonic nanoseconds since this scheduler was created.
    pub fn now(&self) -> u64 {
        self.inner.epoch.elapsed().as_nanos() as u64
    }

    /// Number of entries still in the heap (including tombstones).
    pub fn pending(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake.notify_all();
        if let Some(handle) = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
    }
}

fn driver_loop(inner: &SchedulerInner) {
    let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        let due = match queue.peek() {
            None => {
                queue = inner
                    .wake
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
                continue;
            }
            Some(top) if top.state.cancelled.load(Ordering::Acquire) => {
                queue.pop();
                continue;
            }
            Some(top) if top.deadline <= now => queue.pop().expect("peeked entry vanished"),
            Some(top) => {
                let wait = top.deadline - now;
                let (guard, _timeout) = inner
                    .wake
                    .wait_timeout(queue, wait)
                    .unwrap_or_else(|e| e.into_inner());
                queue = guard;
                continue;
            }
        };

        drop(queue);
        dispatch(inner, due);
        queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
    }
}

fn dispatch(inner: &SchedulerInner, entry: Entry) {
    entry.state.fired.store(true, Ordering::Release);
    match &inner.executor {
        Some(executor) => {
            let callback = entry.callback;
            if let Err(err) = executor.submit(callback) {
                tracing::warn!(%err, "timer dispatch to executor failed");
            }
        }
        None => {
            if catch_unwind(AssertUnwindSafe(entry.callback)).is_err() {
                tracing::warn!("timer callback panicked; driver continues");
            }
        }
    }
}
