//! outbound batching: one `writev` per pass, as many messages as fit.
//!
//! a pass assembles up to [`WRITEV_ITEM_ONCE`] messages into at most
//! [`WRITEV_ARRAY_SIZE`] iovec entries and [`WRITE_MAX_COMBINE_BYTES`]
//! bytes, strictly serving higher priorities first but always finishing
//! the in-flight message (tracked by the socket's `queue_index`) before
//! touching anything else. the iovec-to-message index bookkeeping is kept
//! as explicit arithmetic over fixed stack arrays; correctness of the
//! partial-write accounting depends on the exact index tracking, so it is
//! not hidden behind iterator plumbing.

use crate::error::{Drive, Result, TransportError};
use crate::machine::SocketContext;
use crate::message::{OutData, OutMessage, PRIORITY_COUNT};
use crate::protocol::{ALIGN_BYTES, MSG_HEADER_LENGTH};
use crate::stats::{stat_add, SocketStats};
use crate::worker::ActiveSocket;
use std::io::{IoSlice, Write};
use std::ptr::NonNull;

/// iovec slots available to one `writev`.
pub(crate) const WRITEV_ARRAY_SIZE: usize = 128;

/// messages combined into one `writev`.
pub(crate) const WRITEV_ITEM_ONCE: usize = 64;

/// byte ceiling for one combined write.
pub(crate) const WRITE_MAX_COMBINE_BYTES: usize = 256 * 1024;

/// padding source; the wire content of padding bytes is unspecified.
static PADDING: [u8; ALIGN_BYTES] = [0u8; ALIGN_BYTES];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegKind {
    Header,
    Data,
    Padding,
}

/// maps one iovec entry back to the message it came from.
#[derive(Clone, Copy)]
struct SegTag {
    priority: usize,
    /// index into the priority's batch message array.
    index: usize,
    kind: SegKind,
}

/// one assembled writev batch.
///
/// iovec entries borrow header bytes and payload segments of messages that
/// stay linked on their queues until completion pops them, so the erased
/// lifetimes stay valid across the unlocked `writev` window.
struct WriteBatch {
    write_vec: [IoSlice<'static>; WRITEV_ARRAY_SIZE],
    seg_tags: [SegTag; WRITEV_ARRAY_SIZE],
    msgs: [[Option<NonNull<OutMessage>>; WRITEV_ITEM_ONCE]; PRIORITY_COUNT],
    msg_counts: [usize; PRIORITY_COUNT],
    vec_count: usize,
    total_msg_count: usize,
    total_bytes: usize,
    /// a stop condition fired: more messages were waiting.
    fetch_done: bool,
    /// the final message's payload is fully covered by this batch.
    last_msg_complete: bool,
}

/// erase a slice lifetime for the iovec array.
///
/// # safety
///
/// caller must guarantee the backing storage outlives every use of the
/// returned slice. batch slices point into messages owned by the send
/// queues; the owning worker only releases them after the batch completes.
#[inline]
unsafe fn erased(data: &[u8]) -> &'static [u8] {
    std::slice::from_raw_parts(data.as_ptr(), data.len())
}

/// walk the priority queues and build the next batch.
///
/// visit order preserves the historical resume behavior: with an in-flight
/// message on `queue_index > 0`, iteration 0 takes only that queue's head,
/// the following iterations walk priorities 0..3 in order, and the revisit
/// of `queue_index` skips the already-fetched head. with `queue_index == 0`
/// the loop simply walks priorities 0..3 once.
fn assemble_batch(ctx: &SocketContext, queue_index: usize) -> WriteBatch {
    let mut batch = WriteBatch {
        write_vec: [IoSlice::new(&[]); WRITEV_ARRAY_SIZE],
        seg_tags: [SegTag {
            priority: 0,
            index: 0,
            kind: SegKind::Header,
        }; WRITEV_ARRAY_SIZE],
        msgs: [[None; WRITEV_ITEM_ONCE]; PRIORITY_COUNT],
        msg_counts: [0; PRIORITY_COUNT],
        vec_count: 0,
        total_msg_count: 0,
        total_bytes: 0,
        fetch_done: false,
        last_msg_complete: false,
    };

    let mut priority = queue_index;
    let start = if queue_index == 0 { 1 } else { 0 };

    let mut i = start;
    while i <= PRIORITY_COUNT {
        let queue = ctx.queues[priority].lock();

        let mut pos = 0usize;
        if queue_index > 0 && i == queue_index + 1 {
            // the in-flight head was already fetched in iteration 0
            pos = 1;
        }

        while let Some(msg_ptr) = queue.peek(pos) {
            // safety: queue lock held; only the owning worker touches
            // message contents (module doc in queue.rs)
            let msg = unsafe { &mut *msg_ptr.as_ptr() };

            let remain_len;
            if (msg.bytes_sent as usize) < MSG_HEADER_LENGTH {
                // safety: message outlives the batch, see WriteBatch doc
                let header_rest = unsafe { erased(&msg.wire_header[msg.bytes_sent as usize..]) };
                batch.total_bytes += header_rest.len();
                batch.seg_tags[batch.vec_count] = SegTag {
                    priority,
                    index: batch.msg_counts[priority],
                    kind: SegKind::Header,
                };
                batch.write_vec[batch.vec_count] = IoSlice::new(header_rest);
                batch.vec_count += 1;

                remain_len = msg.header.aligned_data_len as usize;
            } else {
                remain_len = msg.wire_len() - msg.bytes_sent as usize;
            }

            if remain_len > 0 {
                let pad_len = msg.header.padding_len() as usize;
                let remain_data_len = remain_len as i64 - pad_len as i64;

                if remain_data_len > 0 {
                    match &msg.data {
                        OutData::Blocks(chain) => {
                            let slots = WRITEV_ARRAY_SIZE - 1 - batch.vec_count;
                            let mut read_bytes = 0i64;
                            for segment in chain.iter().take(slots) {
                                // safety: segment storage lives on the queued message
                                let seg = unsafe { erased(segment.as_ref()) };
                                read_bytes += seg.len() as i64;
                                batch.seg_tags[batch.vec_count] = SegTag {
                                    priority,
                                    index: batch.msg_counts[priority],
                                    kind: SegKind::Data,
                                };
                                batch.write_vec[batch.vec_count] = IoSlice::new(seg);
                                batch.vec_count += 1;
                            }
                            debug_assert!(read_bytes <= remain_data_len);

                            batch.total_bytes += read_bytes as usize;
                            batch.last_msg_complete = read_bytes == remain_data_len;
                        }
                        OutData::Inline(buf) => {
                            let offset = msg.header.data_len as usize - remain_data_len as usize;
                            // safety: message outlives the batch
                            let seg = unsafe { erased(&buf[offset..]) };
                            batch.total_bytes += seg.len();
                            batch.seg_tags[batch.vec_count] = SegTag {
                                priority,
                                index: batch.msg_counts[priority],
                                kind: SegKind::Data,
                            };
                            batch.write_vec[batch.vec_count] = IoSlice::new(seg);
                            batch.vec_count += 1;
                            batch.last_msg_complete = true;
                        }
                    }
                } else {
                    // payload fully on the wire already
                    batch.last_msg_complete = true;
                }

                if pad_len > 0 && batch.last_msg_complete {
                    let len = if remain_data_len > 0 {
                        pad_len
                    } else {
                        remain_len
                    };
                    batch.total_bytes += len;
                    batch.seg_tags[batch.vec_count] = SegTag {
                        priority,
                        index: batch.msg_counts[priority],
                        kind: SegKind::Padding,
                    };
                    batch.write_vec[batch.vec_count] = IoSlice::new(&PADDING[..len]);
                    batch.vec_count += 1;
                }
            } else {
                batch.last_msg_complete = true;
            }

            batch.msgs[priority][batch.msg_counts[priority]] = Some(msg_ptr);
            batch.msg_counts[priority] += 1;
            batch.total_msg_count += 1;

            if batch.total_msg_count == WRITEV_ITEM_ONCE
                || batch.vec_count >= WRITEV_ARRAY_SIZE - 2
                || batch.total_bytes >= WRITE_MAX_COMBINE_BYTES
            {
                batch.fetch_done = true;
                break;
            }
            if i == 0 {
                // iteration 0 fetches only the in-flight head
                break;
            }
            pos += 1;
        }

        drop(queue);

        if batch.fetch_done {
            break;
        }

        if i == 0 {
            priority = 0;
        } else {
            priority += 1;
        }
        i += 1;
    }

    batch
}

/// distribute `write_bytes` over the batch in iovec order.
///
/// fully-covered entries advance their message's send cursor (consuming
/// payload segments for object data); the first partially-covered entry
/// takes the residual and stops the walk. returns the per-priority counts
/// of completed messages (always a queue prefix), the total, and the new
/// `queue_index` to resume from.
fn apply_written(batch: &WriteBatch, write_bytes: usize) -> ([usize; PRIORITY_COUNT], usize, usize) {
    let mut done_counts = [0usize; PRIORITY_COUNT];
    let mut total_done = 0usize;

    if write_bytes == batch.total_bytes && batch.last_msg_complete {
        // everything assembled went out whole
        done_counts = batch.msg_counts;
        total_done = batch.total_msg_count;
        return (done_counts, total_done, 0);
    }

    let mut remain = write_bytes as i64;
    let mut vi = 0usize;
    while vi < batch.vec_count {
        let seg_len = batch.write_vec[vi].len() as i64;
        remain -= seg_len;

        let tag = batch.seg_tags[vi];
        let msg_ptr = batch.msgs[tag.priority][tag.index].expect("tagged message present");
        // safety: see WriteBatch doc; messages stay queued until completion
        let msg = unsafe { &mut *msg_ptr.as_ptr() };

        if remain >= 0 {
            if tag.kind == SegKind::Data {
                if let OutData::Blocks(chain) = &mut msg.data {
                    chain.consume(seg_len as usize);
                }
            }
            msg.bytes_sent += seg_len as u32;

            if msg.is_done() {
                total_done += 1;
                done_counts[tag.priority] += 1;
            }
        } else {
            let partial = (remain + seg_len) as usize;
            if tag.kind == SegKind::Data {
                if let OutData::Blocks(chain) = &mut msg.data {
                    chain.consume(partial);
                }
            }
            msg.bytes_sent += partial as u32;
            break;
        }

        vi += 1;
    }

    // resume from the first not-done entry
    let queue_index = if vi < batch.vec_count {
        batch.seg_tags[vi].priority
    } else {
        batch.seg_tags[vi - 1].priority
    };

    (done_counts, total_done, queue_index)
}

/// pop and release the completed prefix of each priority queue.
fn complete_batch(ctx: &SocketContext, done_counts: &[usize; PRIORITY_COUNT], stats: &SocketStats) {
    let now = crate::monotonic_nanos();
    for priority in 0..PRIORITY_COUNT {
        if done_counts[priority] == 0 {
            continue;
        }

        let done = ctx.queues[priority].lock().pop_front_n(done_counts[priority]);
        for msg in done {
            stat_add!(stats, send_delayed_time, now.saturating_sub(msg.in_queue_time));
            drop(msg);
        }
    }
}

/// one write pass over a socket.
///
/// returns `More` when the batch was fully flushed and a stop condition
/// had cut assembly short (there is more to send right now), `Wait` when
/// the socket or the queues are drained, and an error on reset or fatal
/// IO failure.
pub(crate) fn deal_write_event(sock: &mut ActiveSocket, stats: &SocketStats) -> Result<Drive> {
    let ctx = sock.ctx.clone();
    let batch = assemble_batch(&ctx, sock.queue_index);

    if batch.vec_count == 0 {
        return Ok(Drive::Wait);
    }

    stat_add!(stats, send_retry_count, batch.total_msg_count);
    stat_add!(stats, call_writev_count);

    let write_bytes = match sock.stream.write_vectored(&batch.write_vec[..batch.vec_count]) {
        Ok(0) => {
            log::debug!("write to {} failed, connection closed", ctx.peer_label());
            return Err(TransportError::ConnectionReset);
        }
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Drive::Wait),
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
            log::debug!("write to {} interrupted, retrying", ctx.peer_label());
            return Ok(Drive::More);
        }
        Err(e) => {
            log::error!("write to {} failed: {}", ctx.peer_label(), e);
            return Err(TransportError::Io(e));
        }
    };

    stat_add!(stats, send_bytes, write_bytes);
    let result = if write_bytes == batch.total_bytes && batch.fetch_done {
        // flushed everything assembled and more was waiting
        Drive::More
    } else {
        Drive::Wait
    };

    let (done_counts, total_done, queue_index) = apply_written(&batch, write_bytes);
    sock.queue_index = queue_index;

    if total_done == 0 {
        return Ok(result);
    }

    stat_add!(stats, send_msg_count, total_done);
    complete_batch(&ctx, &done_counts, stats);

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BlockChain;
    use crate::machine::MachineTable;
    use crate::message::{OutData, Priority};
    use crate::protocol::{MsgHeader, SessionId};
    use crate::queue::push_to_send_queue;
    use bytes::Bytes;
    use std::net::Ipv4Addr;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn test_context() -> Arc<SocketContext> {
        let mut table = MachineTable::new(4, 1, 1);
        let machine = table.add_machine(Ipv4Addr::new(10, 0, 0, 1), 9000).unwrap();
        let ctx = table.alloc_client_context(machine.ip).unwrap();
        ctx.sock_fd.store(10, Ordering::Release);
        ctx
    }

    fn queue_inline(ctx: &SocketContext, priority: Priority, func_id: i32, payload: &[u8]) {
        let stats = SocketStats::default();
        let header = MsgHeader::new(func_id, payload.len() as u32, SessionId::new(1, 2, 3), 0);
        let msg = OutMessage::new(header, OutData::Inline(payload.to_vec()));
        push_to_send_queue(ctx, msg, priority, ctx.version(), &stats).unwrap();
    }

    fn queue_blocks(ctx: &SocketContext, priority: Priority, func_id: i32, segments: &[&[u8]]) {
        let stats = SocketStats::default();
        let mut chain = BlockChain::new();
        let mut total = 0;
        for seg in segments {
            total += seg.len();
            chain.push(Bytes::copy_from_slice(seg));
        }
        let header = MsgHeader::new(func_id, total as u32, SessionId::new(1, 2, 3), 0);
        let msg = OutMessage::new(header, OutData::Blocks(chain));
        push_to_send_queue(ctx, msg, priority, ctx.version(), &stats).unwrap();
    }

    fn drain_done(ctx: &SocketContext, done_counts: &[usize; PRIORITY_COUNT]) {
        for priority in 0..PRIORITY_COUNT {
            if done_counts[priority] > 0 {
                ctx.queues[priority].lock().pop_front_n(done_counts[priority]);
            }
        }
    }

    #[test]
    fn test_assemble_single_inline_message() {
        let ctx = test_context();
        queue_inline(&ctx, Priority::High, 7, b"hello");

        let batch = assemble_batch(&ctx, 0);
        // header + data + 3 padding bytes
        assert_eq!(batch.vec_count, 3);
        assert_eq!(batch.total_msg_count, 1);
        assert_eq!(batch.total_bytes, MSG_HEADER_LENGTH + 8);
        assert!(batch.last_msg_complete);
        assert!(!batch.fetch_done);
        assert_eq!(batch.write_vec[0].len(), MSG_HEADER_LENGTH);
        assert_eq!(batch.write_vec[1].len(), 5);
        assert_eq!(batch.write_vec[2].len(), 3);
        assert_eq!(batch.seg_tags[2].kind, SegKind::Padding);
    }

    #[test]
    fn test_assemble_zero_length_payload_is_header_only() {
        let ctx = test_context();
        queue_inline(&ctx, Priority::High, 7, b"");

        let batch = assemble_batch(&ctx, 0);
        assert_eq!(batch.vec_count, 1);
        assert_eq!(batch.total_bytes, MSG_HEADER_LENGTH);
        assert!(batch.last_msg_complete);
    }

    #[test]
    fn test_assemble_block_chain_uses_one_slot_per_segment() {
        let ctx = test_context();
        queue_blocks(&ctx, Priority::Mid, 7, &[b"abcd", b"efgh"]);

        let batch = assemble_batch(&ctx, 0);
        // header + 2 data segments, no padding (8 bytes aligned)
        assert_eq!(batch.vec_count, 3);
        assert_eq!(batch.seg_tags[1].kind, SegKind::Data);
        assert_eq!(batch.seg_tags[2].kind, SegKind::Data);
        assert_eq!(batch.total_bytes, MSG_HEADER_LENGTH + 8);
    }

    #[test]
    fn test_full_write_completes_all() {
        let ctx = test_context();
        queue_inline(&ctx, Priority::High, 1, b"0123456789"); // wire 32+16
        queue_inline(&ctx, Priority::Low, 2, b"x"); // wire 32+8

        let batch = assemble_batch(&ctx, 0);
        let (done_counts, total_done, queue_index) = apply_written(&batch, batch.total_bytes);
        assert_eq!(total_done, 2);
        assert_eq!(done_counts, [1, 0, 1]);
        assert_eq!(queue_index, 0);
    }

    #[test]
    fn test_partial_write_resumes_mid_message() {
        // two 100-byte payloads, socket takes exactly 150 bytes:
        // message 1 (132 wire bytes) completes, message 2 resumes at
        // bytes_sent == 18
        let ctx = test_context();
        let payload = [0x5au8; 100];
        queue_inline(&ctx, Priority::High, 1, &payload);
        queue_inline(&ctx, Priority::High, 2, &payload);

        let batch = assemble_batch(&ctx, 0);
        assert_eq!(batch.total_bytes, 2 * (MSG_HEADER_LENGTH + 104));

        let (done_counts, total_done, queue_index) = apply_written(&batch, 150);
        assert_eq!(total_done, 1);
        assert_eq!(done_counts, [1, 0, 0]);
        assert_eq!(queue_index, Priority::High.index());

        drain_done(&ctx, &done_counts);
        let queue = ctx.queues[Priority::High.index()].lock();
        let head = queue.peek(0).unwrap();
        assert_eq!(unsafe { head.as_ref().header.func_id }, 2);
        assert_eq!(unsafe { head.as_ref().bytes_sent }, 150 - 136);
    }

    #[test]
    fn test_single_header_byte_write() {
        let ctx = test_context();
        queue_inline(&ctx, Priority::High, 1, b"abc");

        let batch = assemble_batch(&ctx, 0);
        let (_, total_done, queue_index) = apply_written(&batch, 1);
        assert_eq!(total_done, 0);
        assert_eq!(queue_index, Priority::High.index());

        let queue = ctx.queues[Priority::High.index()].lock();
        assert_eq!(unsafe { queue.peek(0).unwrap().as_ref().bytes_sent }, 1);
    }

    #[test]
    fn test_resume_serves_inflight_before_higher_priority() {
        // a partially-sent low message is finished before the high queue
        // is touched; high then precedes low's successors
        let ctx = test_context();
        queue_inline(&ctx, Priority::Low, 1, &[1u8; 64]);
        queue_inline(&ctx, Priority::Low, 2, b"tail");
        queue_inline(&ctx, Priority::High, 3, b"urgent");

        // simulate: low head already has 10 bytes on the wire
        {
            let queue = ctx.queues[Priority::Low.index()].lock();
            let mut head = queue.peek(0).unwrap();
            unsafe { head.as_mut().bytes_sent = 10 };
        }

        let batch = assemble_batch(&ctx, Priority::Low.index());
        // in-flight low head first, then high, then low's successor
        assert_eq!(batch.seg_tags[0].priority, Priority::Low.index());
        assert_eq!(batch.seg_tags[0].kind, SegKind::Header);
        assert_eq!(batch.write_vec[0].len(), MSG_HEADER_LENGTH - 10);

        let priorities: Vec<usize> = batch.seg_tags[..batch.vec_count]
            .iter()
            .map(|t| t.priority)
            .collect();
        let first_high = priorities
            .iter()
            .position(|&p| p == Priority::High.index())
            .unwrap();
        let low_after_high = priorities[first_high..]
            .iter()
            .any(|&p| p == Priority::Low.index());
        assert!(low_after_high, "low successor must follow high: {:?}", priorities);

        // counts: 2 low + 1 high
        assert_eq!(batch.msg_counts[Priority::Low.index()], 2);
        assert_eq!(batch.msg_counts[Priority::High.index()], 1);
        assert_eq!(batch.total_msg_count, 3);
    }

    #[test]
    fn test_resume_skips_refetching_inflight_head() {
        // with queue_index == mid, the revisit of mid must not duplicate
        // the head message
        let ctx = test_context();
        queue_inline(&ctx, Priority::Mid, 1, b"first");
        queue_inline(&ctx, Priority::Mid, 2, b"second");
        {
            let queue = ctx.queues[Priority::Mid.index()].lock();
            let mut head = queue.peek(0).unwrap();
            unsafe { head.as_mut().bytes_sent = 5 };
        }

        let batch = assemble_batch(&ctx, Priority::Mid.index());
        assert_eq!(batch.msg_counts[Priority::Mid.index()], 2);
        assert_eq!(batch.total_msg_count, 2);

        // exactly one header segment per message
        let header_count = batch.seg_tags[..batch.vec_count]
            .iter()
            .filter(|t| t.kind == SegKind::Header)
            .count();
        assert_eq!(header_count, 2);
    }

    #[test]
    fn test_message_budget_stop_condition() {
        let ctx = test_context();
        for id in 0..(WRITEV_ITEM_ONCE as i32 + 10) {
            queue_inline(&ctx, Priority::High, id, b"");
        }

        let batch = assemble_batch(&ctx, 0);
        assert!(batch.fetch_done);
        assert_eq!(batch.total_msg_count, WRITEV_ITEM_ONCE);
    }

    #[test]
    fn test_partial_block_chain_consumes_acknowledged_bytes() {
        let ctx = test_context();
        queue_blocks(&ctx, Priority::High, 1, &[&[7u8; 16], &[8u8; 16]]);

        let batch = assemble_batch(&ctx, 0);
        // header + 16 bytes of the first segment + 4 into the second
        let (_, total_done, _) = apply_written(&batch, MSG_HEADER_LENGTH + 20);
        assert_eq!(total_done, 0);

        let queue = ctx.queues[Priority::High.index()].lock();
        let msg_ptr = queue.peek(0).unwrap();
        let msg = unsafe { msg_ptr.as_ref() };
        assert_eq!(msg.bytes_sent as usize, MSG_HEADER_LENGTH + 20);
        if let OutData::Blocks(chain) = &msg.data {
            assert_eq!(chain.read_avail(), 12);
        } else {
            panic!("expected block payload");
        }
    }
}
