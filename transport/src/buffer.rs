//! buffer types shared between the IO workers and message consumers.
//!
//! inbound: a worker streams socket reads into a large [`RecvBuffer`] and
//! hands completed payload ranges out as [`BodyBlock`]s without copying.
//! the buffer is therefore written at its tail by exactly one worker while
//! earlier, completed ranges are read-shared; that split is expressed with
//! an `UnsafeCell` and a documented contract rather than a lock.
//!
//! outbound: payloads are either a [`BlockChain`] of reference-counted
//! [`Bytes`] segments, consumed from the head as `writev` acknowledges
//! bytes, or a small inline byte buffer owned by the message itself.

use bytes::{Buf, Bytes};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;

/// a fixed-size receive buffer.
///
/// # safety (contract)
///
/// - exactly one thread (the socket's owning worker) writes, and only to
///   offsets at or past its private `current` cursor.
/// - [`BodyBlock`]s only cover ranges the worker has completed, strictly
///   below `current`, and the worker never writes an offset twice.
///
/// completed ranges and the write area are therefore always disjoint, so
/// concurrent reads of blocks while the worker appends are race-free.
pub struct RecvBuffer {
    data: UnsafeCell<Box<[u8]>>,
}

// safety: see the struct contract; disjoint-range discipline is upheld by
// the reassembly code, the only writer.
unsafe impl Send for RecvBuffer {}
unsafe impl Sync for RecvBuffer {}

impl RecvBuffer {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            data: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        // safety: the length of the allocation never changes
        unsafe { (&*self.data.get()).len() }
    }

    /// the writable tail starting at `start`.
    ///
    /// # safety
    ///
    /// caller must be the buffer's single writer and `start` must be at or
    /// past every completed range handed out as a [`BodyBlock`].
    #[inline]
    pub(crate) unsafe fn write_area(&self, start: usize) -> &mut [u8] {
        &mut (&mut *self.data.get())[start..]
    }

    /// a completed range of the buffer.
    ///
    /// callers pass ranges below the writer's cursor only; see the struct
    /// contract.
    #[inline]
    pub(crate) fn range(&self, start: usize, len: usize) -> &[u8] {
        // safety: completed ranges are never written again
        unsafe { &(&*self.data.get())[start..start + len] }
    }
}

/// a completed slice of payload inside a shared [`RecvBuffer`].
///
/// holding the `Arc` keeps the backing buffer alive for as long as any
/// consumer still references the payload, which is also what keeps an
/// in-progress frame header valid after the reader moves on to a fresh
/// buffer.
#[derive(Clone)]
pub struct BodyBlock {
    buf: Arc<RecvBuffer>,
    start: usize,
    len: usize,
}

impl BodyBlock {
    pub(crate) fn new(buf: Arc<RecvBuffer>, start: usize, len: usize) -> Self {
        debug_assert!(start + len <= buf.capacity());
        Self { buf, start, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.range(self.start, self.len)
    }
}

impl std::fmt::Debug for BodyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyBlock")
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

/// the payload of one received frame: zero or more [`BodyBlock`]s in wire
/// order, padding already stripped.
#[derive(Debug, Clone, Default)]
pub struct BodyChain {
    blocks: Vec<BodyBlock>,
}

impl BodyChain {
    pub(crate) fn new(blocks: Vec<BodyBlock>) -> Self {
        Self { blocks }
    }

    /// number of blocks.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// total payload bytes across all blocks.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BodyBlock> {
        self.blocks.iter()
    }

    /// flatten into one owned buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data_len());
        for block in &self.blocks {
            out.extend_from_slice(block.as_slice());
        }
        out
    }
}

/// an outbound payload built from reference-counted segments.
///
/// segments are consumed from the head as the socket acknowledges bytes;
/// fully-written segments are dropped, releasing their backing storage.
#[derive(Debug, Default)]
pub struct BlockChain {
    segments: VecDeque<Bytes>,
}

impl BlockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: Bytes) -> Self {
        let mut chain = Self::new();
        chain.push(data);
        chain
    }

    /// append a segment; empty segments are ignored.
    pub fn push(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.segments.push_back(data);
        }
    }

    /// unsent bytes remaining in the chain.
    #[inline]
    pub fn read_avail(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// drop `len` acknowledged bytes from the head of the chain.
    pub fn consume(&mut self, mut len: usize) {
        while len > 0 {
            let front = self
                .segments
                .front_mut()
                .expect("consume past end of block chain");
            let avail = front.len();
            if len < avail {
                front.advance(len);
                return;
            }
            len -= avail;
            self.segments.pop_front();
        }
    }

    /// walk the pending segments in order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_buffer_write_then_read() {
        let buf = RecvBuffer::new(1024);
        assert_eq!(buf.capacity(), 1024);

        // safety: single writer, range not yet shared
        unsafe {
            buf.write_area(0)[..5].copy_from_slice(b"hello");
        }

        let block = BodyBlock::new(buf.clone(), 0, 5);
        assert_eq!(block.as_slice(), b"hello");
        assert_eq!(block.len(), 5);
    }

    #[test]
    fn test_body_chain_concat() {
        let buf = RecvBuffer::new(64);
        unsafe {
            buf.write_area(0)[..10].copy_from_slice(b"helloworld");
        }

        let chain = BodyChain::new(vec![
            BodyBlock::new(buf.clone(), 0, 5),
            BodyBlock::new(buf.clone(), 5, 5),
        ]);
        assert_eq!(chain.block_count(), 2);
        assert_eq!(chain.data_len(), 10);
        assert_eq!(chain.to_vec(), b"helloworld");
    }

    #[test]
    fn test_block_chain_consume_within_segment() {
        let mut chain = BlockChain::new();
        chain.push(Bytes::from_static(b"abcdef"));
        assert_eq!(chain.read_avail(), 6);

        chain.consume(2);
        assert_eq!(chain.read_avail(), 4);
        assert_eq!(chain.iter().next().unwrap().as_ref(), b"cdef");
    }

    #[test]
    fn test_block_chain_consume_across_segments() {
        let mut chain = BlockChain::new();
        chain.push(Bytes::from_static(b"abc"));
        chain.push(Bytes::from_static(b"defgh"));

        chain.consume(4);
        assert_eq!(chain.read_avail(), 4);
        assert_eq!(chain.iter().next().unwrap().as_ref(), b"efgh");

        chain.consume(4);
        assert_eq!(chain.read_avail(), 0);
        assert!(chain.iter().next().is_none());
    }

    #[test]
    fn test_block_chain_ignores_empty_segments() {
        let mut chain = BlockChain::new();
        chain.push(Bytes::new());
        chain.push(Bytes::from_static(b"x"));
        assert_eq!(chain.iter().count(), 1);
    }
}
