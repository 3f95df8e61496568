//! NUMA-partitioned, size-classed buffer pool with zero-copy slicing.
//!
//! The pool keeps one bounded free list per (NUMA node × size class). A `get`
//! maps the requested size to the smallest class that fits, reuses a region
//! from the matching free list when possible, and otherwise allocates a fresh
//! region on the requested node. Requests above the largest class are served
//! at exact size and bypass reuse.
//!
//! ## Ownership discipline
//!
//! [`Buffer`] is a value type. The buffer handed out by `get` is the
//! *primary* owner; [`Buffer::slice`] produces views that share the backing
//! region but carry no release rights. Dropping the primary releases the
//! physical allocation exactly once: the region is recycled only when no
//! views remain alive, and a release after the pool itself was dropped is a
//! silent no-op (the back-reference is weak).

use crate::affinity;
use crate::alloc::Region;
use crate::control::Control;
use crate::error::Result;
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Capacity ladder for pooled buffers: 2K .. 1M.
pub const SIZE_CLASSES: [usize; 10] = [
    2 * 1024,
    4 * 1024,
    8 * 1024,
    16 * 1024,
    32 * 1024,
    64 * 1024,
    128 * 1024,
    256 * 1024,
    512 * 1024,
    1024 * 1024,
];

/// Largest pooled capacity; bigger requests bypass reuse.
pub const MAX_POOLED_SIZE: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

/// Free-list depth per (node × class).
const FREE_LIST_CAPACITY: usize = 4096;

/// Maps a request size to the smallest class index that fits.
#[inline]
fn class_for(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&c| c >= size)
}

/// Bounded MPMC free list of reusable regions.
struct FreeList {
    regions: Mutex<VecDeque<Arc<Region>>>,
    capacity: usize,
}

impl FreeList {
    fn new(capacity: usize) -> Self {
        Self {
            regions: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn try_pop(&self) -> Option<Arc<Region>> {
        self.regions.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    /// Returns false when the list is at capacity (the region is then simply
    /// dropped, returning the memory to the OS).
    fn try_push(&self, region: Arc<Region>) -> bool {
        let mut regions = self.regions.lock().unwrap_or_else(|e| e.into_inner());
        if regions.len() >= self.capacity {
            return false;
        }
        regions.push_back(region);
        true
    }
}

struct NodeLists {
    classes: Vec<FreeList>,
}

struct PoolShared {
    nodes: Vec<NodeLists>,
    total_alloc: CachePadded<AtomicU64>,
    total_free: CachePadded<AtomicU64>,
    per_node_free: Vec<CachePadded<AtomicU64>>,
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Total regions handed out (reused or freshly allocated requests both
    /// count once per `get`).
    pub total_alloc: u64,
    /// Total primary releases.
    pub total_free: u64,
    /// Buffers currently owned by callers.
    pub in_use: u64,
    /// Release counts per NUMA node.
    pub per_node_free: Vec<u64>,
}

/// NUMA-partitioned, size-classed buffer pool. Cheap to clone; clones share
/// the same free lists and statistics.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Creates a pool partitioned over `node_count` NUMA nodes (clamped to at
    /// least one).
    pub fn new(node_count: usize) -> Self {
        let node_count = node_count.max(1);
        let nodes = (0..node_count)
            .map(|_| NodeLists {
                classes: SIZE_CLASSES
                    .iter()
                    .map(|_| FreeList::new(FREE_LIST_CAPACITY))
                    .collect(),
            })
            .collect();
        let per_node_free = (0..node_count)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                nodes,
                total_alloc: CachePadded::new(AtomicU64::new(0)),
                total_free: CachePadded::new(AtomicU64::new(0)),
                per_node_free,
            }),
        }
    }

    /// Number of NUMA partitions.
    pub fn node_count(&self) -> usize {
        self.shared.nodes.len()
    }

    /// Fetches a buffer of at least `size` bytes, preferring `node`.
    ///
    /// `node < 0` means "auto" (the caller's current node). Out-of-range
    /// nodes clamp to 0. Never fails: a free-list miss allocates.
    pub fn get(&self, size: usize, node: i32) -> Buffer {
        let node = self.resolve_node(node);
        let size = size.max(1);

        let (region, class) = match class_for(size) {
            Some(class) => {
                let list = &self.shared.nodes[node].classes[class];
                let region = list
                    .try_pop()
                    .unwrap_or_else(|| Arc::new(Region::alloc(SIZE_CLASSES[class], node as i32)));
                (region, Some(class))
            }
            // Oversize: exact allocation, never recycled.
            None => (Arc::new(Region::alloc(size, node as i32)), None),
        };

        self.shared.total_alloc.fetch_add(1, Ordering::Relaxed);

        Buffer {
            region,
            offset: 0,
            len: size,
            node,
            class,
            pool: Arc::downgrade(&self.shared),
            primary: true,
        }
    }

    /// Returns a buffer to its origin pool. Equivalent to dropping it; both
    /// paths release exactly once.
    pub fn put(&self, buffer: Buffer) {
        drop(buffer);
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        let total_alloc = self.shared.total_alloc.load(Ordering::Relaxed);
        let total_free = self.shared.total_free.load(Ordering::Relaxed);
        PoolStats {
            total_alloc,
            total_free,
            in_use: total_alloc.saturating_sub(total_free),
            per_node_free: self
                .shared
                .per_node_free
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Publishes the pool counters as debug probes on the control plane.
    pub fn register_probes(&self, prefix: &str, control: &dyn Control) {
        let probes: [(&str, fn(&PoolShared) -> u64); 3] = [
            ("total_alloc", |s| s.total_alloc.load(Ordering::Relaxed)),
            ("total_free", |s| s.total_free.load(Ordering::Relaxed)),
            ("in_use", |s| {
                s.total_alloc
                    .load(Ordering::Relaxed)
                    .saturating_sub(s.total_free.load(Ordering::Relaxed))
            }),
        ];
        for (name, read) in probes {
            let shared = Arc::downgrade(&self.shared);
            control.register_debug_probe(
                &format!("{prefix}.{name}"),
                Box::new(move || shared.upgrade().map_or(0, |s| read(&s))),
            );
        }
    }

    fn resolve_node(&self, node: i32) -> usize {
        let node = if node < 0 { affinity::current_node() } else { node };
        let node = if node < 0 { 0 } else { node as usize };
        // Out-of-range nodes clamp to 0.
        if node < self.shared.nodes.len() {
            node
        } else {
            0
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(affinity::numa_node_count())
    }
}

/// A contiguous byte range backed by pool-owned memory.
pub struct Buffer {
    region: Arc<Region>,
    offset: usize,
    len: usize,
    node: usize,
    class: Option<usize>,
    pool: Weak<PoolShared>,
    primary: bool,
}

impl Buffer {
    /// Logical length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Full capacity of the backing class (equals `len` for views).
    #[inline]
    pub fn capacity(&self) -> usize {
        if self.primary {
            self.region.capacity() - self.offset
        } else {
            self.len
        }
    }

    /// NUMA node the backing memory was placed on.
    #[inline]
    pub fn node(&self) -> usize {
        self.node
    }

    /// Size class capacity in bytes, `None` for oversize allocations.
    #[inline]
    pub fn size_class(&self) -> Option<usize> {
        self.class.map(|c| SIZE_CLASSES[c])
    }

    /// Shared view of the buffer contents.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the range is within the region and writers require `&mut
        // self`, which the borrow checker serializes against this borrow.
        // Disjoint views/primary ranges may read concurrently.
        unsafe { self.region.slice(self.offset, self.len) }
    }

    /// Exclusive view of the buffer contents.
    ///
    /// Writing through the primary while views of the same range are alive is
    /// a protocol violation; the pool's contract is fill-then-slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: in-bounds range; exclusivity per the fill-then-slice
        // contract stated above.
        unsafe { self.region.slice_mut(self.offset, self.len) }
    }

    /// Shrinks the logical length (e.g. after a short read). No-op when
    /// `len` is not smaller than the current length.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Returns a zero-copy view of `[from, to)`.
    ///
    /// The view shares backing memory, pool reference, and class with the
    /// original but carries no release rights: the physical allocation is
    /// released exactly once, by the primary buffer.
    ///
    /// # Panics
    ///
    /// Panics if `from > to` or `to > len`.
    pub fn slice(&self, from: usize, to: usize) -> Buffer {
        assert!(from <= to && to <= self.len, "slice range out of bounds");
        Buffer {
            region: Arc::clone(&self.region),
            offset: self.offset + from,
            len: to - from,
            node: self.node,
            class: self.class,
            pool: Weak::clone(&self.pool),
            primary: false,
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("node", &self.node)
            .field("class", &self.size_class())
            .field("primary", &self.primary)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !self.primary {
            return;
        }
        // Pool already destroyed: drop the region silently.
        let Some(shared) = self.pool.upgrade() else {
            return;
        };

        shared.total_free.fetch_add(1, Ordering::Relaxed);
        shared.per_node_free[self.node].fetch_add(1, Ordering::Relaxed);

        if let Some(class) = self.class {
            // Recycle only when no views share the region; otherwise let the
            // last view drop the memory so a reused region can never alias a
            // live slice.
            if Arc::strong_count(&self.region) == 1 {
                let _ = shared.nodes[self.node].classes[class].try_push(Arc::clone(&self.region));
            }
        }
    }
}

/// Convenience: fills a fresh buffer from `data`.
pub fn buffer_from(pool: &BufferPool, data: &[u8], node: i32) -> Result<Buffer> {
    let mut buf = pool.get(data.len(), node);
    buf.as_mut_slice()[..data.len()].copy_from_slice(data);
    buf.truncate(data.len());
    Ok(buf)
}
