//! per-connection send queues.
//!
//! each connection carries three FIFOs, one per [`Priority`]. producers on
//! any thread append under the queue lock; the owning worker is the only
//! consumer. messages are held as raw heap pointers so the worker can keep
//! references to a batch while the lock is released around `writev`, the
//! same custody model as an intrusive linked list, with the queue as the
//! owner of every message it links.
//!
//! # safety
//!
//! - a message enters a queue via `Box::into_raw` and leaves it exactly
//!   once via `Box::from_raw` (batch completion, purge, or queue drop).
//! - between the assembly lock and the completion lock the owning worker
//!   may dereference batch pointers freely: producers only edit the deque
//!   itself (push/splice), never message contents, and completed messages
//!   always form a queue prefix, so the entries a batch points at stay
//!   linked until that same worker pops them.
//! - `bytes_sent` is written only by the owning worker; the head-insert
//!   path that reads it also runs on the owning worker.

use crate::error::{Result, TransportError};
use crate::machine::SocketContext;
use crate::message::{OutMessage, Priority};
use crate::stats::{stat_add, SocketStats};
use crate::protocol::MSG_HEADER_LENGTH;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};

/// FIFO of heap-owned messages.
pub(crate) struct MessageQueue {
    items: VecDeque<NonNull<OutMessage>>,
}

// safety: the pointers are uniquely owned by the queue (see module doc);
// moving the queue between threads moves that ownership with it.
unsafe impl Send for MessageQueue {}

impl MessageQueue {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// message at `index` counted from the head, without unlinking it.
    #[inline]
    pub(crate) fn peek(&self, index: usize) -> Option<NonNull<OutMessage>> {
        self.items.get(index).copied()
    }

    pub(crate) fn push_back(&mut self, msg: Box<OutMessage>) {
        self.items
            .push_back(unsafe { NonNull::new_unchecked(Box::into_raw(msg)) });
    }

    /// place a message at the front, or just behind the head when the head
    /// is already partially transmitted, so an in-flight frame is never
    /// interleaved.
    pub(crate) fn insert_head(&mut self, msg: Box<OutMessage>) {
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(msg)) };
        match self.items.front() {
            None => self.items.push_back(ptr),
            Some(head) => {
                // safety: bytes_sent is stable here, see module doc
                let head_touched = unsafe { head.as_ref().bytes_sent > 0 };
                if head_touched {
                    self.items.insert(1, ptr);
                } else {
                    self.items.push_front(ptr);
                }
            }
        }
    }

    /// unlink the first `count` messages (the completed prefix of a write
    /// batch) and hand their ownership back as boxes.
    pub(crate) fn pop_front_n(&mut self, count: usize) -> Vec<Box<OutMessage>> {
        debug_assert!(count <= self.items.len());
        self.items
            .drain(..count)
            .map(|ptr| unsafe { Box::from_raw(ptr.as_ptr()) })
            .collect()
    }

    fn drain_all(&mut self) -> Vec<Box<OutMessage>> {
        self.items
            .drain(..)
            .map(|ptr| unsafe { Box::from_raw(ptr.as_ptr()) })
            .collect()
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        for ptr in self.items.drain(..) {
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }
}

/// one priority FIFO with its splice lock.
pub(crate) struct SendQueue {
    inner: Mutex<MessageQueue>,
}

impl SendQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(MessageQueue::new()),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, MessageQueue> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// append a message to a connection's priority queue.
///
/// the caller passes the context version it observed when it picked this
/// connection; a mismatch (the socket was purged since) or a closed socket
/// rejects the message so it is never stranded on a dead queue.
pub(crate) fn push_to_send_queue(
    ctx: &SocketContext,
    mut msg: Box<OutMessage>,
    priority: Priority,
    observed_version: u32,
    stats: &SocketStats,
) -> Result<()> {
    let wire_len = msg.wire_len() as u64;

    {
        let mut queue = ctx.queues[priority.index()].lock();

        let current_version = ctx.version.load(Ordering::Acquire);
        if current_version != observed_version {
            drop(queue);
            log::debug!(
                "session version {} != socket context version {}, peer {}",
                observed_version,
                current_version,
                ctx.peer_label()
            );
            stat_add!(stats, fail_msg_count);
            stat_add!(stats, fail_msg_bytes, wire_len);
            return Err(TransportError::StaleSession);
        }

        if ctx.sock_fd.load(Ordering::Acquire) < 0 {
            drop(queue);
            log::debug!("socket context for {} is closed", ctx.peer_label());
            stat_add!(stats, fail_msg_count);
            stat_add!(stats, fail_msg_bytes, wire_len);
            return Err(TransportError::StaleSession);
        }

        msg.in_queue_time = crate::monotonic_nanos();
        queue.push_back(msg);
    }

    stat_add!(stats, push_msg_count);
    stat_add!(stats, push_msg_bytes, wire_len);
    Ok(())
}

/// front-insert for ping and control messages; only ever called by the
/// connection's owning worker.
pub(crate) fn insert_into_send_queue_head(
    ctx: &SocketContext,
    mut msg: Box<OutMessage>,
    priority: Priority,
    stats: &SocketStats,
) {
    let wire_len = msg.wire_len() as u64;

    {
        let mut queue = ctx.queues[priority.index()].lock();
        msg.in_queue_time = crate::monotonic_nanos();
        queue.insert_head(msg);
    }

    stat_add!(stats, push_msg_count);
    stat_add!(stats, push_msg_bytes, wire_len);
}

/// drop everything queued on a connection and bump its version so late
/// enqueues from sessions that observed the old state are rejected.
pub(crate) fn clear_send_queue(ctx: &SocketContext, stats: &SocketStats, warning: bool) {
    let mut count = 0u64;
    let mut drop_bytes = 0u64;

    for queue in ctx.queues.iter() {
        let mut guard = queue.lock();
        ctx.version.fetch_add(1, Ordering::AcqRel);
        for msg in guard.drain_all() {
            drop_bytes += (MSG_HEADER_LENGTH + msg.header.aligned_data_len as usize) as u64;
            count += 1;
            drop(msg);
        }
    }

    if count > 0 {
        if warning {
            log::warn!("released {} queued messages for {}", count, ctx.peer_label());
        } else {
            log::debug!("released {} queued messages for {}", count, ctx.peer_label());
        }

        stat_add!(stats, drop_msg_count, count);
        stat_add!(stats, drop_bytes, drop_bytes);
    }
}
