//! SeqLock (sequence lock) provides low-latency reads with single-writer
//! semantics. readers never block and can detect when they have read
//! inconsistent data by checking version numbers.
//!
//! # characteristics
//!
//! - **single writer**: only one thread may write at a time (not enforced, caller responsibility)
//! - **multiple readers**: any number of threads can read concurrently
//! - **lock-free reads**: readers never block, they retry on conflict
//! - **writer priority**: writers are never blocked by readers
//!
//! # how it works
//!
//! - version counter starts at 0 (even)
//! - writer increments version to odd before write, even after write
//! - reader checks version before and after read
//! - if version changed or is odd, reader retries

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// a sequence lock for single-writer, multi-reader scenarios.
///
/// `T` must be `Copy` because:
/// - readers copy the data out (to avoid holding references during retry)
/// - writers copy the data in
///
/// # safety
///
/// this type assumes single-writer semantics. the caller must ensure that
/// only one thread calls write methods at a time.
#[repr(C)]
pub struct SeqLock<T> {
    /// version counter, cache-line padded to keep reader traffic off the data line.
    version: CachePadded<AtomicU64>,
    data: UnsafeCell<T>,
}

// safety: SeqLock is safe to share between threads because:
// - reads use the SeqLock protocol (version check before/after)
// - the single-writer assumption is documented (caller responsibility)
unsafe impl<T: Send> Send for SeqLock<T> {}
unsafe impl<T: Send + Sync> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    /// create a new SeqLock with the given initial value.
    #[inline]
    pub const fn new(value: T) -> Self {
        Self {
            version: CachePadded::new(AtomicU64::new(0)),
            data: UnsafeCell::new(value),
        }
    }

    /// try to read the value without blocking.
    ///
    /// returns `None` if a write is in progress or occurred during the read.
    /// the caller should retry in a loop.
    #[inline]
    pub fn try_read(&self) -> Option<T> {
        let v1 = self.version.load(Ordering::Acquire);
        if v1 & 1 == 1 {
            return None;
        }

        // safety: version check after the copy detects a concurrent write
        let value = unsafe { *self.data.get() };

        fence(Ordering::Acquire);

        let v2 = self.version.load(Ordering::Acquire);
        if v1 != v2 {
            return None;
        }

        Some(value)
    }

    /// read the value, spinning until a consistent read is achieved.
    ///
    /// # example
    ///
    /// ```
    /// use mesh_sync::SeqLock;
    ///
    /// let lock = SeqLock::new(42u64);
    /// assert_eq!(lock.read(), 42);
    /// ```
    #[inline]
    pub fn read(&self) -> T {
        loop {
            if let Some(value) = self.try_read() {
                return value;
            }
            std::hint::spin_loop();
        }
    }

    /// write a new value.
    ///
    /// # safety (contract)
    ///
    /// this method must only be called from a single writer thread.
    /// concurrent calls to `write` will result in undefined behavior.
    #[inline]
    pub fn write(&self, value: T) {
        // begin write: version becomes odd
        self.bump();

        // safety: single-writer assumption, no concurrent writes
        unsafe {
            *self.data.get() = value;
        }

        // end write: version becomes even again
        self.bump();
    }

    /// mutate the value in place using a closure.
    ///
    /// same single-writer contract as [`write`](Self::write).
    #[inline]
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
    {
        self.bump();

        // safety: single-writer assumption, no concurrent writes
        unsafe {
            f(&mut *self.data.get());
        }

        self.bump();
    }

    /// get the current version number.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn bump(&self) {
        let v = self.version.load(Ordering::Relaxed);
        self.version.store(v.wrapping_add(1), Ordering::Release);
    }
}

impl<T: Copy + Default> Default for SeqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for SeqLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_read() {
            Some(value) => f.debug_struct("SeqLock").field("value", &value).finish(),
            None => f
                .debug_struct("SeqLock")
                .field("value", &"<write in progress>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_read_write() {
        let lock = SeqLock::new(42u64);
        assert_eq!(lock.read(), 42);

        lock.write(100);
        assert_eq!(lock.read(), 100);
    }

    #[test]
    fn test_try_read() {
        let lock = SeqLock::new(42u64);
        assert_eq!(lock.try_read(), Some(42));
    }

    #[test]
    fn test_update() {
        let lock = SeqLock::new([0u64; 2]);
        lock.update(|data| {
            data[0] = 1;
            data[1] = 2;
        });

        assert_eq!(lock.read(), [1, 2]);
    }

    #[test]
    fn test_struct_payload() {
        #[derive(Copy, Clone, Debug, PartialEq)]
        struct Pacing {
            wait_ns: u64,
            interval_us: u64,
        }

        let lock = SeqLock::new(Pacing {
            wait_ns: 0,
            interval_us: 0,
        });
        lock.write(Pacing {
            wait_ns: 1_000_000,
            interval_us: 500,
        });

        let p = lock.read();
        assert_eq!(p.wait_ns, 1_000_000);
        assert_eq!(p.interval_us, 500);
    }

    #[test]
    fn test_version_increments() {
        let lock = SeqLock::new(0u64);
        assert_eq!(lock.version(), 0);

        lock.write(1);
        assert_eq!(lock.version(), 2); // 0 -> 1 -> 2

        lock.write(2);
        assert_eq!(lock.version(), 4); // 2 -> 3 -> 4
    }

    #[test]
    fn test_writer_reader_contention() {
        let lock = Arc::new(SeqLock::new(0u64));

        let writer_lock = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            for i in 0..1000u64 {
                writer_lock.write(i);
            }
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    let mut last_seen = 0u64;
                    for _ in 0..10_000 {
                        let value = lock.read();
                        // the writer only moves the value forward
                        assert!(value >= last_seen);
                        last_seen = value;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn test_default() {
        let lock: SeqLock<u64> = SeqLock::default();
        assert_eq!(lock.read(), 0);
    }

    #[test]
    fn test_debug() {
        let lock = SeqLock::new(42u64);
        let debug = format!("{:?}", lock);
        assert!(debug.contains("SeqLock"));
        assert!(debug.contains("42"));
    }
}
