//! Per-loop buffer management.
//!
//! Every read is preceded by an allocation from the `BufferPool`. The
//! returned `PooledBuffer` is the single owner of its memory: it is moved
//! from the read path into a pending write and handed back to the pool when
//! it is dropped. Release therefore happens exactly once on every path
//! (completed write, failed write, unused read, cancelled write on close)
//! without any explicit free call.
//!
//! The pool is owned by the event-loop thread and is not `Send`.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Allocation and release counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers handed out.
    pub allocated: u64,
    /// Buffers returned (dropped).
    pub released: u64,
    /// Allocation requests that could not be satisfied.
    pub failed: u64,
}

impl PoolStats {
    /// Buffers currently owned by an in-flight operation.
    pub fn outstanding(&self) -> u64 {
        self.allocated - self.released
    }
}

struct PoolInner {
    /// Released buffers kept for reuse (LIFO for cache locality).
    free_list: Vec<Vec<u8>>,
    /// Upper bound on buffers alive at the same time.
    max_outstanding: usize,
    /// Upper bound on the free list length.
    max_cached: usize,
    outstanding: usize,
    stats: PoolStats,
}

impl PoolInner {
    fn release(&mut self, mut data: Vec<u8>) {
        debug_assert!(self.outstanding > 0, "release without allocation");
        self.outstanding -= 1;
        self.stats.released += 1;
        if self.free_list.len() < self.max_cached {
            data.clear();
            self.free_list.push(data);
        }
    }
}

/// Hands out owned buffers and takes them back on drop.
#[derive(Clone)]
pub struct BufferPool {
    inner: Rc<RefCell<PoolInner>>,
}

impl BufferPool {
    /// Create a pool.
    ///
    /// # Arguments
    /// * `max_outstanding` - Maximum number of buffers alive at once
    /// * `max_cached` - Maximum number of released buffers kept for reuse
    pub fn new(max_outstanding: usize, max_cached: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PoolInner {
                free_list: Vec::with_capacity(max_cached.min(1024)),
                max_outstanding,
                max_cached,
                outstanding: 0,
                stats: PoolStats::default(),
            })),
        }
    }

    /// Allocate a buffer of roughly `suggested_size` bytes.
    ///
    /// Returns `None` when there is no usable memory: the outstanding limit
    /// is reached, the size is zero, or the allocator refuses the request.
    /// Callers must check before reading into it.
    pub fn alloc(&self, suggested_size: usize) -> Option<PooledBuffer> {
        let mut inner = self.inner.borrow_mut();

        if suggested_size == 0 || inner.outstanding >= inner.max_outstanding {
            inner.stats.failed += 1;
            return None;
        }

        let mut data = inner.free_list.pop().unwrap_or_default();
        if data.capacity() < suggested_size {
            let additional = suggested_size - data.len();
            if data.try_reserve_exact(additional).is_err() {
                inner.stats.failed += 1;
                return None;
            }
        }
        data.resize(suggested_size, 0);

        inner.outstanding += 1;
        inner.stats.allocated += 1;

        Some(PooledBuffer {
            data,
            filled: 0,
            pool: Rc::clone(&self.inner),
        })
    }

    /// Snapshot of the allocation counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.borrow().stats
    }

    /// Number of buffers currently owned by an operation.
    pub fn outstanding(&self) -> usize {
        self.inner.borrow().outstanding
    }

    /// Number of released buffers waiting for reuse.
    pub fn cached(&self) -> usize {
        self.inner.borrow().free_list.len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("BufferPool")
            .field("outstanding", &inner.outstanding)
            .field("max_outstanding", &inner.max_outstanding)
            .field("cached", &inner.free_list.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

/// A buffer owned by exactly one operation.
///
/// Used first as a read target (`spare_mut`), then, after `set_filled`, as
/// the source of the echo write (`filled`). Dropping it releases it.
pub struct PooledBuffer {
    data: Vec<u8>,
    filled: usize,
    pool: Rc<RefCell<PoolInner>>,
}

impl PooledBuffer {
    /// The whole region, for reading into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record how many bytes a read placed at the start of the buffer.
    pub fn set_filled(&mut self, n: usize) {
        debug_assert!(n <= self.data.len());
        self.filled = n.min(self.data.len());
    }

    /// The bytes carried by this buffer.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Size of the allocated region.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("filled", &self.filled)
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.borrow_mut().release(data);
    }
}
