//! in-flight message types.

use crate::buffer::{BlockChain, BodyChain};
use crate::protocol::{MsgHeader, SessionId, MSG_HEADER_LENGTH};

/// number of send priorities per connection.
pub const PRIORITY_COUNT: usize = 3;

/// which of the three per-connection FIFOs a message is queued on.
/// this selects a queue, it is not a heap ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Priority {
    High = 0,
    Mid = 1,
    Low = 2,
}

impl Priority {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Priority::High,
            1 => Priority::Mid,
            _ => Priority::Low,
        }
    }
}

/// an outbound payload: either a chain of shared segments or a small
/// buffer owned inline by the message.
#[derive(Debug)]
pub enum OutData {
    Blocks(BlockChain),
    Inline(Vec<u8>),
}

impl OutData {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            OutData::Blocks(chain) => chain.read_avail(),
            OutData::Inline(buf) => buf.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// zero-length payload, used by control messages.
    pub fn empty() -> Self {
        OutData::Inline(Vec::new())
    }
}

/// a message queued for transmission on one connection.
///
/// the header is kept both decoded and in wire form: the wire bytes are
/// what the writev batcher points iovec entries at, so they must stay at a
/// stable address for the message's lifetime on the queue.
pub struct OutMessage {
    pub header: MsgHeader,
    pub(crate) wire_header: [u8; MSG_HEADER_LENGTH],
    pub(crate) data: OutData,

    /// bytes of header + aligned payload already written to the socket.
    pub(crate) bytes_sent: u32,

    /// monotonic ns when the message entered its queue, for delay stats.
    pub(crate) in_queue_time: u64,
}

impl OutMessage {
    pub fn new(header: MsgHeader, data: OutData) -> Box<Self> {
        debug_assert_eq!(header.data_len as usize, data.len());
        let wire_header = header.encode();
        Box::new(Self {
            header,
            wire_header,
            data,
            bytes_sent: 0,
            in_queue_time: 0,
        })
    }

    /// full wire footprint of this message.
    #[inline]
    pub fn wire_len(&self) -> usize {
        self.header.wire_len()
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.bytes_sent as usize >= self.wire_len()
    }
}

/// a received frame handed to the session layer's inbox.
pub struct InMessage {
    pub session_id: SessionId,
    pub func_id: i32,
    pub body: BodyChain,
    pub data_len: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionId;
    use bytes::Bytes;

    #[test]
    fn test_priority_index_roundtrip() {
        for p in [Priority::High, Priority::Mid, Priority::Low] {
            assert_eq!(Priority::from_index(p.index()), p);
        }
        assert_eq!(Priority::High.index(), 0);
    }

    #[test]
    fn test_out_message_wire_len() {
        let header = MsgHeader::new(9, 5, SessionId::new(1, 2, 3), 4);
        let msg = OutMessage::new(header, OutData::Inline(b"hello".to_vec()));
        // 32-byte header + payload padded to 8
        assert_eq!(msg.wire_len(), 40);
        assert!(!msg.is_done());
    }

    #[test]
    fn test_out_message_block_payload() {
        let mut chain = crate::buffer::BlockChain::new();
        chain.push(Bytes::from_static(b"abcd"));
        chain.push(Bytes::from_static(b"efgh"));

        let header = MsgHeader::new(9, 8, SessionId::new(1, 2, 3), 4);
        let msg = OutMessage::new(header, OutData::Blocks(chain));
        assert_eq!(msg.data.len(), 8);
        assert_eq!(msg.wire_len(), 40);
    }
}
