//! Poll-mode event loop: batch dequeue, handler fan-out, adaptive backoff.
//!
//! Events are queued into an internal SPSC ring (the producer side is
//! serialized by a short lock so any thread may post) and drained by a single
//! driver thread in batches. Every registered handler observes every event in
//! enqueue order. When a drain comes up empty the driver backs off
//! adaptively, starting at a nanosecond and doubling up to a millisecond.

use crate::backoff::Backoff;
use crate::error::Result;
use crate::ring::Ring;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

/// Receives events dispatched by the loop.
pub trait EventHandler<E>: Send + Sync {
    /// Called once per event, on the driver thread, in enqueue order.
    fn on_event(&self, event: &E);
}

impl<E, F> EventHandler<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        self(event);
    }
}

type HandlerList<E> = Arc<Vec<Arc<dyn EventHandler<E>>>>;

/// Batched event dispatcher with a bounded queue.
pub struct EventLoop<E> {
    ring: Ring<E>,
    post_lock: Mutex<()>,
    handlers: RwLock<HandlerList<E>>,
    batch_size: usize,
    running: AtomicBool,
    stop_flag: AtomicBool,
}

impl<E: Send + 'static> EventLoop<E> {
    /// Creates an event loop draining up to `batch_size` events per pass.
    /// `queue_capacity` is rounded up to a power of two.
    pub fn new(batch_size: usize, queue_capacity: usize) -> Result<Self> {
        let capacity = queue_capacity.max(1).next_power_of_two();
        Ok(Self {
            ring: Ring::new(capacity)?,
            post_lock: Mutex::new(()),
            handlers: RwLock::new(Arc::new(Vec::new())),
            batch_size: batch_size.max(1),
            running: AtomicBool::new(false),
            stop_flag: AtomicBool::new(false),
        })
    }

    /// Registers a handler. Takes effect at the driver's next batch.
    pub fn register(&self, handler: Arc<dyn EventHandler<E>>) {
        let mut guard = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**guard).clone();
        next.push(handler);
        *guard = Arc::new(next);
    }

    /// Unregisters a previously registered handler (by identity). Returns
    /// whether it was present.
    pub fn unregister(&self, handler: &Arc<dyn EventHandler<E>>) -> bool {
        let mut guard = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let before = guard.len();
        let next: Vec<_> = guard
            .iter()
            .filter(|h| !Arc::ptr_eq(h, handler))
            .cloned()
            .collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    /// Enqueues an event; returns false when the queue is full.
    pub fn post(&self, event: E) -> bool {
        let _serialize = self.post_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ring.try_enqueue(event).is_ok()
    }

    /// Number of queued, not yet dispatched events.
    pub fn pending(&self) -> usize {
        self.ring.len()
    }

    /// Drives the loop until [`stop`](Self::stop) is called.
    ///
    /// There must be at most one driver; a second concurrent `run` returns
    /// immediately.
    pub fn run(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut backoff = Backoff::new();
        while !self.stop_flag.load(Ordering::Acquire) {
            // Latest snapshot at batch start; registrations apply between
            // batches, never inside one.
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();

            let mut drained = 0;
            while drained < self.batch_size {
                match self.ring.try_dequeue() {
                    Some(event) => {
                        for handler in handlers.iter() {
                            handler.on_event(&event);
                        }
                        drained += 1;
                    }
                    None => break,
                }
            }

            if drained == 0 {
                backoff.wait();
            } else {
                backoff.reset();
            }
        }

        self.running.store(false, Ordering::Release);
    }

    /// Signals the driver, waits for it to exit, and clears the handler
    /// list. The loop may be restarted afterwards.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
        *self.handlers.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(Vec::new());
        self.stop_flag.store(false, Ordering::Release);
    }
}
