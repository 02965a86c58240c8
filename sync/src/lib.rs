//! lock-free synchronization primitives.
//!
//! this crate provides synchronization primitives optimized for scenarios where:
//! - read operations vastly outnumber writes
//! - latency is critical (nanosecond-level reads)
//! - single-writer semantics are acceptable
//!
//! the mesh transport uses these for its pacing globals: one governor thread
//! recomputes send-wait and loop-interval values once per second, every IO
//! worker reads them on every scheduling decision.
//!
//! # available primitives
//!
//! - [`SeqLock`]: sequence lock for single-writer, multi-reader scenarios
//!
//! # example
//!
//! ```
//! use mesh_sync::SeqLock;
//!
//! // create a SeqLock with initial data
//! let lock = SeqLock::new([0u64; 2]);
//!
//! // write (single-threaded only)
//! lock.write([1, 2]);
//!
//! // read (from any thread, lock-free)
//! let data = lock.read();
//! assert_eq!(data, [1, 2]);
//! ```

mod seqlock;

pub use seqlock::SeqLock;
