//! Reusable byte buffers for the record hot path.

use std::sync::{Mutex, OnceLock};

use crate::lock;

/// Nominal capacity of a freshly allocated buffer.
const NOMINAL_CAPACITY: usize = 500;

/// Buffers whose capacity grew beyond this are dropped on release instead of
/// being retained, so the pool cannot accumulate pathologically large
/// allocations.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// Upper bound on shelved buffers.
const MAX_SHELVED: usize = 1024;

/// A thread-safe, best-effort LIFO pool of byte buffers.
///
/// Every adapter `write` acquires a buffer, copies the caller's bytes in and
/// owns the copy until the record leaves the adapter; the buffer is released
/// back here once the record has been written to the sink (or destroyed on a
/// drop path the adapter controls).
pub struct BufferPool {
    shelf: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            shelf: Mutex::new(Vec::new()),
        }
    }

    /// Returns the process-wide pool shared by all adapters.
    pub fn global() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(BufferPool::new)
    }

    /// Hands out an empty buffer, reusing a shelved one when available.
    pub fn acquire(&self) -> Vec<u8> {
        lock(&self.shelf)
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(NOMINAL_CAPACITY))
    }

    /// Acquires a buffer and copies `bytes` into it.
    pub fn copy_from(&self, bytes: &[u8]) -> Vec<u8> {
        let mut buf = self.acquire();
        buf.extend_from_slice(bytes);
        buf
    }

    /// Returns a buffer to the pool.
    ///
    /// Buffers above the 64 KiB re-entry cap are dropped to bound the pool's
    /// memory cost.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        let mut shelf = lock(&self.shelf);
        if shelf.len() < MAX_SHELVED {
            shelf.push(buf);
        }
    }

    /// Number of buffers currently shelved.
    pub fn shelved(&self) -> usize {
        lock(&self.shelf).len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
