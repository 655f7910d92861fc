use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
    /// Buffers allocated because the free list was empty.
    pub allocated: u64,
}

impl PoolStats {
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

/// A pool of fixed-capacity packet buffers.
///
/// The pool never caps the number of outstanding buffers; bursts are bounded by the consumers
/// (relay queue draining, socket reads), not here. Buffers return to the pool when the
/// [`PooledBuf`] is dropped, so every control-flow path releases exactly once.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
    acquired: AtomicU64,
    released: AtomicU64,
    allocated: AtomicU64,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                free: Mutex::new(Vec::new()),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                allocated: AtomicU64::new(0),
            }),
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Take a buffer of `buffer_capacity()` bytes. Contents are unspecified.
    pub fn acquire(&self) -> PooledBuf {
        let recycled = self
            .inner
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        let data = match recycled {
            Some(data) => data,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.inner.capacity]
            }
        };
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            data,
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn stats(&self) -> PoolStats {
        // Released first, so a concurrent snapshot never sees more releases than acquisitions.
        let released = self.inner.released.load(Ordering::Acquire);
        PoolStats {
            acquired: self.inner.acquired.load(Ordering::Acquire),
            released,
            allocated: self.inner.allocated.load(Ordering::Relaxed),
        }
    }
}

impl PoolInner {
    fn release(&self, data: Vec<u8>) {
        if data.len() == self.capacity {
            self.free
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(data);
        }
        self.released.fetch_add(1, Ordering::Release);
    }
}

/// A buffer on loan from a [`BufferPool`]. Owned by exactly one pipeline stage at a time.
pub struct PooledBuf {
    data: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for PooledBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.data));
    }
}
