//! Reusable byte buffers.
//!
//! [`BufferPool`] hands out page-rounded buffers for read and readdir
//! replies. [`FreeList`] is the plain recycling list behind the raw-read
//! buffer pool and the request pool.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

static PAGE_SIZE: LazyLock<usize> = LazyLock::new(|| {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
});

/// The OS page size.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Number of whole pages needed to hold `size` bytes, at least one.
fn pages_for(size: usize) -> usize {
    size.div_ceil(page_size()).max(1)
}

/// Source of output buffers for replies with flat payloads.
pub trait BufferPool: Send + Sync {
    /// Return a buffer of length `size` whose capacity is a whole number of
    /// pages.
    fn alloc_buffer(&self, size: usize) -> Vec<u8>;

    /// Hand a buffer back. Buffers with zero or non page-multiple capacity
    /// are dropped silently.
    fn free_buffer(&self, buf: Vec<u8>);
}

/// Pool keeping one free list per page count.
pub struct PageBufferPool {
    buffers_by_pages: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    per_class_limit: usize,
}

impl PageBufferPool {
    pub fn new() -> Self {
        Self::with_limit(64)
    }

    /// A pool that keeps at most `per_class_limit` idle buffers per size.
    pub fn with_limit(per_class_limit: usize) -> Self {
        PageBufferPool {
            buffers_by_pages: Mutex::new(HashMap::new()),
            per_class_limit,
        }
    }

    /// Idle buffers currently held, summed over all size classes.
    pub fn idle(&self) -> usize {
        self.buffers_by_pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl Default for PageBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool for PageBufferPool {
    fn alloc_buffer(&self, size: usize) -> Vec<u8> {
        let pages = pages_for(size);
        let recycled = self
            .buffers_by_pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&pages)
            .and_then(Vec::pop);

        let mut buf = recycled.unwrap_or_else(|| Vec::with_capacity(pages * page_size()));
        buf.clear();
        buf.resize(size, 0);
        buf
    }

    fn free_buffer(&self, buf: Vec<u8>) {
        let cap = buf.capacity();
        if cap == 0 || cap % page_size() != 0 {
            return;
        }
        let mut classes = self
            .buffers_by_pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let list = classes.entry(cap / page_size()).or_default();
        if list.len() < self.per_class_limit {
            list.push(buf);
        }
    }
}

/// Pool that never recycles; every buffer is a fresh allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcBufferPool;

impl BufferPool for GcBufferPool {
    fn alloc_buffer(&self, size: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(pages_for(size) * page_size());
        buf.resize(size, 0);
        buf
    }

    fn free_buffer(&self, _buf: Vec<u8>) {}
}

/// Bounded stack of reusable values.
pub(crate) struct FreeList<T> {
    items: Mutex<Vec<T>>,
    limit: usize,
}

impl<T> FreeList<T> {
    pub(crate) fn new(limit: usize) -> Self {
        FreeList {
            items: Mutex::new(Vec::new()),
            limit,
        }
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    pub(crate) fn give(&self, item: T) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.len() < self.limit {
            items.push(item);
        }
    }
}
