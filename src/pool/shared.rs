//! Externally-serialized access to a pool.
//!
//! The core pool has no internal synchronization: chain splices are
//! multi-step buffer updates. Callers that drive one arena from several
//! threads must hold a lock around every call — [`SharedPool`] is that
//! lock, and [`GlobalPool`] is the one-per-process convenience instance.

use crate::sync::{Mutex, OnceLock};

use super::arena::{Pool, PoolError, PoolPtr};
use super::buffer::{PageBuffer, VmError};

/// A pool behind a mutex, one lock acquisition per operation.
///
/// For compound consumer transactions (several allocs that must not
/// interleave with another thread's), use [`SharedPool::with`] and hold
/// the guard for the whole transaction.
pub struct SharedPool<B: AsRef<[u8]>> {
    inner: Mutex<Pool<B>>,
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SharedPool<B> {
    /// Format `buf` and wrap the resulting pool.
    ///
    /// # Errors
    ///
    /// Same as [`Pool::format`].
    pub fn format(buf: B) -> Result<Self, PoolError> {
        Ok(Self {
            inner: Mutex::new(Pool::format(buf)?),
        })
    }

    /// # Errors
    ///
    /// Same as [`Pool::alloc`].
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn alloc(&self, size: usize) -> Result<PoolPtr, PoolError> {
        self.inner.lock().unwrap().alloc(size)
    }

    /// # Errors
    ///
    /// Same as [`Pool::erase`].
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn erase(&self, ptr: PoolPtr) -> Result<(), PoolError> {
        self.inner.lock().unwrap().erase(ptr)
    }

    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn space(&self, ptr: PoolPtr) -> usize {
        self.inner.lock().unwrap().space(ptr)
    }

    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn total(&self) -> usize {
        self.inner.lock().unwrap().total()
    }

    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn usage(&self) -> usize {
        self.inner.lock().unwrap().usage()
    }

    /// Run a compound transaction against the pool under one lock
    /// acquisition.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn with<R>(&self, f: impl FnOnce(&mut Pool<B>) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }
}

/// Everything the offset fields can address: blocks start within the first
/// 16383 bytes and the largest block spans 16384, so capacity beyond this
/// is unreachable.
pub const DEFAULT_GLOBAL_CAPACITY: usize = 32 * 1024;

static GLOBAL_POOL: OnceLock<SharedPool<PageBuffer>> = OnceLock::new();

/// Process-wide pool over a page-backed buffer.
///
/// Initialized explicitly via [`GlobalPool::init`], or lazily with
/// [`DEFAULT_GLOBAL_CAPACITY`] on first use. Never torn down.
pub struct GlobalPool;

impl GlobalPool {
    fn ensure(capacity: usize) -> Result<&'static SharedPool<PageBuffer>, VmError> {
        if let Some(pool) = GLOBAL_POOL.get() {
            return Ok(pool);
        }
        let buf = PageBuffer::new(capacity)?;
        let pool =
            SharedPool::format(buf).expect("a page-sized buffer holds the control structure");
        // A racing thread may have won; its instance stays, ours unmaps.
        drop(GLOBAL_POOL.set(pool));
        Ok(GLOBAL_POOL.get().expect("global pool just initialized"))
    }

    /// Initialize the global pool with an explicit capacity. A no-op if it
    /// is already initialized (the existing instance is kept).
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the backing mapping fails.
    pub fn init(capacity: usize) -> Result<(), VmError> {
        Self::ensure(capacity).map(drop)
    }

    #[must_use]
    pub fn get() -> Option<&'static SharedPool<PageBuffer>> {
        GLOBAL_POOL.get()
    }

    /// Allocate from the global pool, initializing it with
    /// [`DEFAULT_GLOBAL_CAPACITY`] if needed.
    ///
    /// # Errors
    ///
    /// Same as [`Pool::alloc`].
    ///
    /// # Panics
    ///
    /// Panics if lazy initialization cannot map the backing buffer, or if
    /// the lock is poisoned.
    pub fn alloc(size: usize) -> Result<PoolPtr, PoolError> {
        match Self::ensure(DEFAULT_GLOBAL_CAPACITY) {
            Ok(pool) => pool.alloc(size),
            Err(e) => panic!("failed to init GlobalPool: {e:?}"),
        }
    }

    /// Erase from the global pool.
    ///
    /// # Errors
    ///
    /// Same as [`Pool::erase`].
    ///
    /// # Panics
    ///
    /// Panics if the pool was never initialized, or if the lock is
    /// poisoned.
    pub fn erase(ptr: PoolPtr) -> Result<(), PoolError> {
        match Self::get() {
            Some(pool) => pool.erase(ptr),
            None => panic!("GlobalPool not initialized but erase called"),
        }
    }

    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn space(ptr: PoolPtr) -> usize {
        Self::get().map_or(0, |pool| pool.space(ptr))
    }

    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn total() -> usize {
        Self::get().map_or(0, SharedPool::total)
    }

    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn usage() -> usize {
        Self::get().map_or(0, SharedPool::usage)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::thread;

    #[test]
    fn test_shared_pool_basic() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool = SharedPool::format(vec![0u8; 256]).unwrap();
        let baseline = pool.usage();
        let ptr = pool.alloc(10).unwrap();
        assert_eq!(pool.space(ptr), 16);
        pool.erase(ptr).unwrap();
        assert_eq!(pool.usage(), baseline);
        assert_eq!(pool.total(), 256);
    }

    #[test]
    fn test_shared_pool_with_transaction() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool = SharedPool::format(vec![0u8; 256]).unwrap();
        let (a, b) = pool
            .with(|p| {
                let a = p.alloc(10)?;
                let b = p.alloc(10)?;
                Ok::<_, PoolError>((a, b))
            })
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_shared_pool_thread_contention() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool = Arc::new(SharedPool::format(vec![0u8; 8192]).unwrap());
        let baseline = pool.usage();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let ptr = pool.alloc(24).unwrap();
                        pool.erase(ptr).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.usage(), baseline);
    }

    #[test]
    fn test_global_pool_lazy_init_and_round_trip() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let ptr = GlobalPool::alloc(100).unwrap();
        assert!(GlobalPool::total() >= DEFAULT_GLOBAL_CAPACITY);
        assert_eq!(GlobalPool::space(ptr), 128);
        GlobalPool::erase(ptr).unwrap();
        assert_eq!(GlobalPool::space(ptr), 0);
        // Explicit init after the fact keeps the existing instance.
        GlobalPool::init(1024).unwrap();
        assert!(GlobalPool::total() >= DEFAULT_GLOBAL_CAPACITY);
    }
}
