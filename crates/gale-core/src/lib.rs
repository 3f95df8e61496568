//! gale-core — runtime kernel for the gale WebSocket serving runtime.
//!
//! The kernel provides the concurrency and memory plumbing the data plane is
//! built on:
//!
//! - [`Ring`]: lock-free SPSC bounded ring buffer with cached sequence
//!   numbers and cache-line padding.
//! - [`BufferPool`] / [`Buffer`]: NUMA-partitioned, size-classed buffer pool
//!   with zero-copy slicing and single-release discipline.
//! - [`Executor`]: resizable worker pool with CPU/NUMA pinning.
//! - [`EventLoop`]: batch-draining event dispatcher with adaptive idle
//!   backoff.
//! - [`Scheduler`]: monotonic min-heap timer with cancellable handles.
//! - [`affinity`]: OS-thread CPU and NUMA pinning.
//! - [`SessionRegistry`] / [`SessionContext`]: sharded sessions with
//!   propagation-aware, TTL-capable contexts.
//!
//! # Example
//!
//! ```
//! use gale_core::{BufferPool, Ring};
//!
//! let ring = Ring::new(8).unwrap();
//! ring.try_enqueue(7u64).unwrap();
//! assert_eq!(ring.try_dequeue(), Some(7));
//!
//! let pool = BufferPool::new(1);
//! let mut buf = pool.get(1024, 0);
//! buf.as_mut_slice()[..5].copy_from_slice(b"hello");
//! assert_eq!(buf.slice(0, 5).as_slice(), b"hello");
//! ```

pub mod affinity;
mod alloc;
mod backoff;
mod control;
mod error;
mod event_loop;
mod executor;
mod pool;
mod ring;
mod session;
mod timer;

pub use backoff::Backoff;
pub use control::{Control, ControlHandle, DebugProbe, NoopControl, ReloadHook};
pub use error::{Error, Result};
pub use event_loop::{EventHandler, EventLoop};
pub use executor::{Executor, Task};
pub use pool::{buffer_from, Buffer, BufferPool, PoolStats, MAX_POOLED_SIZE, SIZE_CLASSES};
pub use ring::Ring;
pub use session::{
    ContextValue, DoneSignal, Session, SessionContext, SessionRegistry,
};
pub use timer::{Scheduler, TimerHandle};
