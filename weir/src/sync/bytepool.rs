//! Fragmentation-aware byte buffer pool
//!
//! Allocations are bucketed into four size classes: tiny (64 B steps up
//! to 960 B), small (1 KB steps up to 9 KB), medium (10 KB steps up to
//! 90 KB) and large (100 KB steps up to ~1 MB). Requests above that fall
//! back to direct allocation and are never cached. Buffers return to the
//! pool when the guard drops, so callers never release explicitly. Each
//! size class caches a bounded number of buffers; excess is freed.
use std::sync::{Arc, Mutex, Weak};

const TINY_STEP: usize = 64;
const TINY_MAX: usize = 960;
const SMALL_STEP: usize = 1024;
const SMALL_MAX: usize = 9 * 1024;
const MEDIUM_STEP: usize = 10 * 1024;
const MEDIUM_MAX: usize = 90 * 1024;
const LARGE_STEP: usize = 100 * 1024;
const LARGE_MAX: usize = 1000 * 1024;

/// Cached buffers kept per size class.
const CLASS_CACHE_CAP: usize = 64;

fn class_for(size: usize) -> Option<(usize, usize)> {
    // (index, rounded capacity)
    if size <= TINY_MAX {
        let slot = size.div_ceil(TINY_STEP).max(1);
        return Some((slot - 1, slot * TINY_STEP));
    }
    let tiny_classes = TINY_MAX / TINY_STEP;
    if size <= SMALL_MAX {
        let slot = size.div_ceil(SMALL_STEP);
        return Some((tiny_classes + slot - 1, slot * SMALL_STEP));
    }
    let small_classes = SMALL_MAX / SMALL_STEP;
    if size <= MEDIUM_MAX {
        let slot = size.div_ceil(MEDIUM_STEP);
        return Some((tiny_classes + small_classes + slot - 1, slot * MEDIUM_STEP));
    }
    let medium_classes = MEDIUM_MAX / MEDIUM_STEP;
    if size <= LARGE_MAX {
        let slot = size.div_ceil(LARGE_STEP);
        return Some((
            tiny_classes + small_classes + medium_classes + slot - 1,
            slot * LARGE_STEP,
        ));
    }
    None
}

fn class_count() -> usize {
    TINY_MAX / TINY_STEP + SMALL_MAX / SMALL_STEP + MEDIUM_MAX / MEDIUM_STEP
        + LARGE_MAX / LARGE_STEP
}

struct Shelves {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
}

/// Pooled buffer allocator for transient payload and I/O buffers.
#[derive(Clone)]
pub struct BytePool {
    shelves: Arc<Shelves>,
}

impl Default for BytePool {
    fn default() -> Self {
        BytePool::new()
    }
}

impl BytePool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        let classes = (0..class_count()).map(|_| Mutex::new(Vec::new())).collect();
        BytePool {
            shelves: Arc::new(Shelves { classes }),
        }
    }

    /// Returns a zero-length buffer with capacity for at least `size`
    /// bytes. The buffer returns to the pool when the guard drops.
    pub fn acquire(&self, size: usize) -> PooledBuf {
        match class_for(size) {
            Some((index, capacity)) => {
                let cached = self
                    .shelves
                    .classes
                    .get(index)
                    .and_then(|shelf| shelf.lock().ok().and_then(|mut s| s.pop()));
                let buf = cached.unwrap_or_else(|| Vec::with_capacity(capacity));
                PooledBuf {
                    buf,
                    class: Some(index),
                    pool: Arc::downgrade(&self.shelves),
                }
            }
            // above the largest class, allocate directly and never cache
            None => PooledBuf {
                buf: Vec::with_capacity(size),
                class: None,
                pool: Weak::new(),
            },
        }
    }

    #[cfg(test)]
    fn cached(&self, index: usize) -> usize {
        self.shelves.classes[index]
            .lock()
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

/// Guard handing out a pooled `Vec<u8>`. Dereferences to the vector;
/// dropping it returns the buffer to its size class.
pub struct PooledBuf {
    buf: Vec<u8>,
    class: Option<usize>,
    pool: Weak<Shelves>,
}

impl std::ops::Deref for PooledBuf {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let index = match self.class {
            Some(i) => i,
            None => return,
        };
        if let Some(shelves) = self.pool.upgrade() {
            if let Some(Ok(mut shelf)) = shelves.classes.get(index).map(|s| s.lock()) {
                if shelf.len() < CLASS_CACHE_CAP {
                    let mut buf = std::mem::take(&mut self.buf);
                    buf.clear();
                    shelf.push(buf);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classes_round_up_within_band() {
        assert_eq!(class_for(1), Some((0, 64)));
        assert_eq!(class_for(64), Some((0, 64)));
        assert_eq!(class_for(65), Some((1, 128)));
        assert_eq!(class_for(960), Some((14, 960)));
        assert_eq!(class_for(961).map(|c| c.1), Some(1024));
        assert_eq!(class_for(9 * 1024 + 1).map(|c| c.1), Some(10 * 1024));
        assert_eq!(class_for(91 * 1024).map(|c| c.1), Some(100 * 1024));
        assert_eq!(class_for(1000 * 1024).map(|c| c.1), Some(1000 * 1024));
    }

    #[test]
    fn oversized_requests_bypass_the_pool() {
        assert_eq!(class_for(LARGE_MAX + 1), None);
        let pool = BytePool::new();
        let buf = pool.acquire(LARGE_MAX + 1);
        assert!(buf.capacity() > LARGE_MAX);
        drop(buf);
        // nothing cached anywhere
        for i in 0..class_count() {
            assert_eq!(pool.cached(i), 0);
        }
    }

    #[test]
    fn buffers_return_on_drop() {
        let pool = BytePool::new();
        let (index, _) = class_for(100).unwrap();
        {
            let mut buf = pool.acquire(100);
            buf.extend_from_slice(b"hello");
        }
        assert_eq!(pool.cached(index), 1);
        // reuse comes back empty
        let buf = pool.acquire(100);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 100);
        assert_eq!(pool.cached(index), 0);
    }

    #[test]
    fn cache_is_capped() {
        let pool = BytePool::new();
        let (index, _) = class_for(64).unwrap();
        let bufs: Vec<_> = (0..CLASS_CACHE_CAP + 8).map(|_| pool.acquire(64)).collect();
        drop(bufs);
        assert_eq!(pool.cached(index), CLASS_CACHE_CAP);
    }

    #[test]
    fn pool_clone_shares_shelves() {
        let pool = BytePool::new();
        let other = pool.clone();
        drop(other.acquire(64));
        assert_eq!(pool.cached(0), 1);
    }
}
