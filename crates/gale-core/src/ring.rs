//! Lock-free single-producer single-consumer bounded ring buffer.
//!
//! The ring is the primitive underneath event loops, connection inboxes, and
//! worker queues. It is strictly SPSC: one thread enqueues, one thread
//! dequeues. Multi-producer or multi-consumer use must be serialized
//! externally (e.g. the event loop holds a short producer-side lock around
//! `try_enqueue`).
//!
//! ## Memory ordering protocol
//!
//! `head` and `tail` are unbounded 64-bit sequence numbers; a slot index is
//! computed as `sequence & mask` only when touching storage, which rules out
//! ABA problems for any realistic lifetime.
//!
//! Producer: load `tail` (Relaxed, single writer), check space against a
//! cached view of `head` (refreshing with Acquire only when the cache is
//! insufficient), write the slot, publish with a Release store to `tail`.
//!
//! Consumer: load `head` (Relaxed, single writer), check availability against
//! a cached view of `tail` (refreshing with Acquire when empty), read the
//! slot, publish with a Release store to `head`.
//!
//! The cached counters live in `UnsafeCell`s with exactly one writer each,
//! so the unsynchronized accesses are sound under the SPSC discipline.

use crate::error::{Error, Result};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded SPSC FIFO with power-of-two capacity.
pub struct Ring<T> {
    // === PRODUCER HOT ===
    /// Tail sequence (written by producer, read by consumer).
    tail: CachePadded<AtomicU64>,
    /// Producer's cached view of head (avoids cross-core reads).
    cached_head: CachePadded<UnsafeCell<u64>>,

    // === CONSUMER HOT ===
    /// Head sequence (written by consumer, read by producer).
    head: CachePadded<AtomicU64>,
    /// Consumer's cached view of tail (avoids cross-core reads).
    cached_tail: CachePadded<UnsafeCell<u64>>,

    mask: u64,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: the producer/consumer protocol above guarantees each slot has a
// single owner at any point, so the ring is Send + Sync whenever T is Send.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Creates a ring with the given capacity.
    ///
    /// The capacity must be a positive power of two, otherwise
    /// `InvalidArgument` is returned.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "ring capacity must be a positive power of two, got {capacity}"
            )));
        }

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));

        Ok(Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            cached_head: CachePadded::new(UnsafeCell::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            cached_tail: CachePadded::new(UnsafeCell::new(0)),
            mask: (capacity - 1) as u64,
            slots: slots.into_boxed_slice(),
        })
    }

    /// Returns the ring capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Returns the current number of items in the ring.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head) as usize
    }

    /// Returns true if the ring is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Relaxed) == self.head.load(Ordering::Relaxed)
    }

    /// Returns true if the ring is full.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Attempts to enqueue an item; fails iff the ring is full.
    ///
    /// On failure the item is handed back so the producer can retry or apply
    /// backpressure. Must only be called from the single producer.
    pub fn try_enqueue(&self, value: T) -> std::result::Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);

        // Fast path: check cached head.
        // SAFETY: cached_head is only written by the producer (this code
        // path), so the unsynchronized read is sound.
        let cached_head = unsafe { *self.cached_head.get() };
        if tail.wrapping_sub(cached_head) as usize >= self.capacity() {
            // Slow path: refresh cache. The Acquire load synchronizes with
            // the consumer's Release store.
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: single producer writer, as above.
            unsafe {
                *self.cached_head.get() = head;
            }
            if tail.wrapping_sub(head) as usize >= self.capacity() {
                return Err(value);
            }
        }

        let idx = (tail & self.mask) as usize;
        // SAFETY: the slot at `tail & mask` is outside [head, tail), so the
        // consumer will not touch it until the Release store below publishes
        // it. Only this producer writes slots beyond tail.
        unsafe {
            (*self.slots[idx].get()).write(value);
        }

        let new_tail = tail.wrapping_add(1);
        debug_assert!(
            new_tail.wrapping_sub(self.head.load(Ordering::Relaxed)) as usize <= self.capacity(),
            "ring over-filled: len exceeds capacity"
        );
        self.tail.store(new_tail, Ordering::Release);
        Ok(())
    }

    /// Attempts to dequeue an item; returns `None` iff the ring is empty.
    ///
    /// Must only be called from the single consumer.
    pub fn try_dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);

        // Fast path: check cached tail.
        // SAFETY: cached_tail is only written by the consumer (this code
        // path), so the unsynchronized read is sound.
        let mut cached_tail = unsafe { *self.cached_tail.get() };
        if cached_tail == head {
            // Slow path: refresh cache. The Acquire load synchronizes with
            // the producer's Release store.
            cached_tail = self.tail.load(Ordering::Acquire);
            // SAFETY: single consumer writer, as above.
            unsafe {
                *self.cached_tail.get() = cached_tail;
            }
            if cached_tail == head {
                return None;
            }
        }

        let idx = (head & self.mask) as usize;
        // SAFETY: the slot at `head & mask` lies in [head, tail): it was
        // fully written by the producer and published via Release, and the
        // Acquire load above synchronizes with that store. The producer will
        // not reuse the slot until head advances past it.
        let value = unsafe { (*self.slots[idx].get()).assume_init_read() };

        let new_head = head.wrapping_add(1);
        debug_assert!(
            new_head <= cached_tail,
            "ring head advanced past tail"
        );
        self.head.store(new_head, Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // Drop all items still sitting in [head, tail).
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let count = tail.wrapping_sub(head) as usize;

        for i in 0..count {
            let idx = ((head.wrapping_add(i as u64)) & self.mask) as usize;
            unsafe {
                std::ptr::drop_in_place((*self.slots[idx].get()).as_mut_ptr());
            }
        }
    }
}
