//! inbound streaming: frame reassembly and dispatch.
//!
//! each active socket reads into a large fixed buffer and carves frames
//! out in place. a frame's header must be contiguous, so a partial header
//! near the end of a buffer is compacted into a fresh one; payload bytes
//! are never copied: completed ranges become [`BodyBlock`]s that share
//! the buffer, and a payload larger than the remaining buffer space keeps
//! accumulating blocks across buffers until the frame closes. padding is
//! stripped as blocks are appended, so consumers only ever see true
//! payload bytes.

use crate::buffer::{BodyBlock, BodyChain, RecvBuffer};
use crate::error::{Drive, Result, TransportError};
use crate::message::{InMessage, OutData, OutMessage, Priority};
use crate::protocol::{
    MsgHeader, SessionId, FUNC_ID_PING_REQUEST, FUNC_ID_PING_RESPONSE, MSG_HEADER_LENGTH,
    NO_SESSION_MSG_SEQ,
};
use crate::queue::insert_into_send_queue_head;
use crate::runtime::Shared;
use crate::stats::{stat_add, SocketStats};
use crate::worker::ActiveSocket;
use std::io::Read;
use std::sync::Arc;

/// a header fragment smaller than this much remaining buffer space is
/// compacted into a fresh buffer instead of waiting in place.
const MIN_REMAIN_SPACE: usize = 4 * 1024;

/// per-socket reassembly state.
///
/// `header_buf`/`header_off` pin the in-progress frame's header, which may
/// live in an older buffer than the one being filled; holding the `Arc`
/// keeps those bytes valid until the frame completes.
pub(crate) struct ReadState {
    buffer: Arc<RecvBuffer>,
    /// write cursor into `buffer`.
    current: usize,

    header_buf: Arc<RecvBuffer>,
    header_off: usize,

    /// body bytes accumulated in previous buffers for the open frame.
    /// a multiple of 8 at every buffer transition.
    recv_body_bytes: usize,

    /// completed body blocks of the open frame.
    blocks: Vec<BodyBlock>,

    buffer_size: usize,
}

impl ReadState {
    pub(crate) fn new(buffer_size: usize) -> Self {
        let buffer = RecvBuffer::new(buffer_size);
        Self {
            header_buf: buffer.clone(),
            buffer,
            current: 0,
            header_off: 0,
            recv_body_bytes: 0,
            blocks: Vec::new(),
            buffer_size,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.capacity() - self.current
    }

    /// start over in a fresh buffer with no open frame.
    fn reset(&mut self) {
        self.buffer = RecvBuffer::new(self.buffer_size);
        self.header_buf = self.buffer.clone();
        self.header_off = 0;
        self.current = 0;
    }

    /// continue the open frame in a fresh buffer; the header stays pinned
    /// in the old one (kept alive by `header_buf` and the block chain).
    fn fresh_buffer(&mut self) {
        self.buffer = RecvBuffer::new(self.buffer_size);
        self.current = 0;
    }

    /// carry `len` bytes of the open frame (header plus any body read so
    /// far) into a fresh buffer and re-anchor the header there.
    fn move_to_new_buffer(&mut self, len: usize) {
        let fresh = RecvBuffer::new(self.buffer_size);
        // safety: fresh buffer has a single writer (us) and no shared
        // ranges yet; source range is complete data below the old cursor
        unsafe {
            fresh.write_area(0)[..len]
                .copy_from_slice(self.header_buf.range(self.header_off, len));
        }
        self.header_buf = fresh.clone();
        self.buffer = fresh;
        self.header_off = 0;
        self.current = len;
    }

    fn append_block(&mut self, first_block: bool, len: usize) {
        let start = if first_block {
            self.header_off + MSG_HEADER_LENGTH
        } else {
            0
        };
        self.blocks
            .push(BodyBlock::new(self.buffer.clone(), start, len));
    }
}

/// one read pass: pull from the socket, then carve and dispatch every
/// complete frame sitting in the buffer.
///
/// returns `More` when the buffer was filled to the end (the socket may
/// have more ready right now), `Wait` once the kernel is drained.
pub(crate) fn deal_read_event(
    sock: &mut ActiveSocket,
    shared: &Shared,
    stats: &SocketStats,
) -> Result<Drive> {
    stat_add!(stats, call_read_count);

    let read_bytes = {
        let reader = &mut sock.reader;
        // safety: this worker is the buffer's single writer and blocks only
        // cover ranges below `current`
        let area = unsafe { reader.buffer.write_area(reader.current) };
        match sock.stream.read(area) {
            Ok(0) => {
                log::debug!(
                    "type: {}, read from {} failed, connection closed",
                    sock.ctx.connect_type.tag(),
                    sock.ctx.peer_label()
                );
                return Err(TransportError::ConnectionReset);
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Drive::Wait),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Drive::More),
            Err(e) => {
                log::error!("read from {} failed: {}", sock.ctx.peer_label(), e);
                return Err(TransportError::Io(e));
            }
        }
    };

    stat_add!(stats, recv_bytes, read_bytes);
    sock.reader.current += read_bytes;

    // a completely filled buffer means the kernel may still hold data
    let outcome = if sock.reader.remaining() == 0 {
        Drive::More
    } else {
        Drive::Wait
    };

    loop {
        let first_block = sock.reader.blocks.is_empty();
        let msg_bytes;
        let recv_body_bytes;

        if first_block {
            msg_bytes = sock.reader.current - sock.reader.header_off;
            if msg_bytes < MSG_HEADER_LENGTH {
                // wait for the rest of the header; compact if the buffer
                // tail is nearly exhausted
                if sock.reader.remaining() < MIN_REMAIN_SPACE {
                    if msg_bytes > 0 {
                        sock.reader.move_to_new_buffer(msg_bytes);
                    } else {
                        sock.reader.reset();
                    }
                }
                return Ok(outcome);
            }
            recv_body_bytes = msg_bytes - MSG_HEADER_LENGTH;
        } else {
            // continuation buffers hold body bytes from offset 0
            msg_bytes = sock.reader.current;
            recv_body_bytes = sock.reader.recv_body_bytes + msg_bytes;
        }

        let header = MsgHeader::decode(
            sock.reader
                .header_buf
                .range(sock.reader.header_off, MSG_HEADER_LENGTH),
            shared.config.check_magic,
        )?;
        let aligned_len = header.aligned_data_len as usize;

        if recv_body_bytes < aligned_len {
            // frame still open
            if recv_body_bytes + sock.reader.remaining() >= aligned_len {
                // remaining buffer can hold the rest, keep reading in place
                return Ok(outcome);
            }

            let chunk = recv_body_bytes - sock.reader.recv_body_bytes;
            let over_padding = recv_body_bytes as i64 - header.data_len as i64;
            let true_chunk = if over_padding > 0 {
                chunk - over_padding as usize
            } else {
                chunk
            };

            if header.func_id < 0 {
                // negative ids must land in a single receive buffer
                if !first_block || msg_bytes >= sock.reader.capacity() {
                    log::error!(
                        "func_id: {}, data length: {} exceeds single buffer limit {}",
                        header.func_id,
                        header.data_len,
                        sock.reader.capacity() - MSG_HEADER_LENGTH
                    );
                    return Err(TransportError::OversizedSingleBufferFrame {
                        func_id: header.func_id,
                        data_len: header.data_len,
                    });
                }

                sock.reader.move_to_new_buffer(msg_bytes);
                return Ok(outcome);
            }

            if sock.reader.remaining() >= MIN_REMAIN_SPACE {
                // plenty of buffer left, keep filling it
                return Ok(outcome);
            }

            if recv_body_bytes % crate::protocol::ALIGN_BYTES != 0 {
                // transitions must happen on aligned boundaries; wait for
                // the stragglers unless the buffer is already full
                if sock.reader.remaining() > 0 {
                    log::debug!(
                        "recv_body_bytes: {} not aligned yet, waiting",
                        recv_body_bytes
                    );
                    return Ok(outcome);
                }
                return Err(TransportError::UnalignedContinuation { recv_body_bytes });
            }

            if true_chunk > 0 {
                sock.reader.append_block(first_block, true_chunk);
            }
            sock.reader.recv_body_bytes = recv_body_bytes;

            if first_block {
                if true_chunk > 0 {
                    // header stays pinned in the old buffer via header_buf
                    sock.reader.fresh_buffer();
                } else {
                    // nothing but the header yet, carry it over
                    sock.reader.move_to_new_buffer(msg_bytes);
                }
            } else {
                sock.reader.fresh_buffer();
            }

            return Ok(outcome);
        }

        // frame complete: bytes of it in this buffer, padding included
        let chunk = if first_block {
            aligned_len
        } else {
            aligned_len - sock.reader.recv_body_bytes
        };
        let padding_len = header.padding_len() as usize;
        let true_chunk = if padding_len > 0 {
            chunk.saturating_sub(padding_len)
        } else {
            chunk
        };

        if true_chunk > 0 {
            sock.reader.append_block(first_block, true_chunk);
        }

        stat_add!(stats, recv_msg_count);
        let body = BodyChain::new(std::mem::take(&mut sock.reader.blocks));
        sock.reader.recv_body_bytes = 0;

        // advance the frame anchor before dispatch state is touched
        if first_block {
            sock.reader.header_off += MSG_HEADER_LENGTH + chunk;
        } else {
            sock.reader.header_buf = sock.reader.buffer.clone();
            sock.reader.header_off = chunk;
        }

        deal_message(header, sock, body, shared, stats);
    }
}

/// route one received frame.
pub(crate) fn deal_message(
    header: MsgHeader,
    sock: &mut ActiveSocket,
    body: BodyChain,
    shared: &Shared,
    stats: &SocketStats,
) {
    if header.func_id == FUNC_ID_PING_REQUEST {
        let age = crate::epoch_secs().saturating_sub(header.session_id.timestamp as u64);
        if age > 1 {
            log::debug!(
                "ping from {} took {}s to arrive",
                sock.ctx.peer_label(),
                age
            );
        }

        // answer pings ahead of everything queued; the request's session id
        // is echoed back untouched
        let response = ping_message(FUNC_ID_PING_RESPONSE, header.session_id);
        insert_into_send_queue_head(&sock.ctx, response, Priority::High, stats);
        return;
    }

    if header.func_id == FUNC_ID_PING_RESPONSE {
        if sock.ping_start_time > 0 {
            let time_used = crate::monotonic_nanos().saturating_sub(sock.ping_start_time);
            stat_add!(stats, ping_success_count);
            stat_add!(stats, ping_time_used, time_used);
            if time_used > shared.config.ping_latency_threshold_ns {
                log::warn!(
                    "ping response from {} took {}us, threshold {}us",
                    sock.ctx.peer_label(),
                    time_used / 1_000,
                    shared.config.ping_latency_threshold_ns / 1_000
                );
            }
            sock.ping_start_time = 0;
        } else {
            log::warn!(
                "unexpected ping response from {}",
                sock.ctx.peer_label()
            );
        }

        if sock.ping_fail_count > 0 {
            sock.ping_fail_count = 0;
        }
        return;
    }

    let Some(route) = shared.session.get_response_session(&header) else {
        // no session wants it; the frame is dropped here
        return;
    };

    if route.call_func {
        shared.handler.deal_message(
            header.session_id,
            route.user_data,
            header.func_id,
            body,
            header.data_len,
        );
    } else {
        stat_add!(stats, enqueue_in_msg_count);
        stat_add!(
            stats,
            enqueue_in_msg_bytes,
            MSG_HEADER_LENGTH as u64 + header.data_len as u64
        );
        shared.session.push_in_message(InMessage {
            session_id: header.session_id,
            func_id: header.func_id,
            body,
            data_len: header.data_len,
        });
    }
}

/// build a zero-length ping frame.
pub(crate) fn ping_message(func_id: i32, session_id: SessionId) -> Box<OutMessage> {
    let header = MsgHeader::new(func_id, 0, session_id, NO_SESSION_MSG_SEQ);
    OutMessage::new(header, OutData::empty())
}
